//! Program-launch plumbing: the argument block the kernel hands over,
//! restricted-process detection, environment capture, the shared cache,
//! inserted libraries, the launch link of the main executable, and the
//! halt channel for unrecoverable errors.
//!
//! In the real launch path the linker has already relocated itself before
//! any of this code can trust a global; the embedding environment
//! guarantees that precondition here.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::{info, warn};

use crate::cache::{self, SharedCache};
use crate::context::{EnvConfig, LinkContext, Linker, ProgramVars, SharedRegionMode};
use crate::error::{Error, Result};
use crate::image::{Image, ImageFlags, ImageId, LoadOptions};
use crate::mach::cputype::{self, CpuId};
use crate::mach::{self, MachFile, header};
use crate::registry::DebuggerErrorInfo;

/// The default directory shared caches live in.
pub const SHARED_CACHE_DIR: &str = "/var/db/dyld";

/// What the kernel passes on the stack at process start.
#[derive(Debug, Clone)]
pub struct BootArgs {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    /// The `key=value` auxiliary vector; `executable_path=` and
    /// `stack_guard=` are recognized.
    pub apple: Vec<String>,
    pub host: CpuId,
    /// The process runs setuid/setgid.
    pub is_setugid: bool,
    /// Where to look for the shared cache; `None` disables the cache
    /// entirely (equivalent to `DYLD_SHARED_REGION=avoid`).
    pub cache_dir: Option<PathBuf>,
}

impl BootArgs {
    pub fn new(host: CpuId) -> BootArgs {
        BootArgs {
            argv: Vec::new(),
            envp: Vec::new(),
            apple: Vec::new(),
            host,
            is_setugid: false,
            cache_dir: Some(PathBuf::from(SHARED_CACHE_DIR)),
        }
    }

    /// The canonical main-image path from `apple[]`, falling back to
    /// `argv[0]`.
    pub fn executable_path(&self) -> Option<PathBuf> {
        for entry in &self.apple {
            if let Some(path) = entry.strip_prefix("executable_path=") {
                return Some(PathBuf::from(path));
            }
        }
        self.argv.first().map(PathBuf::from)
    }

    /// The kernel-provided random seed from `stack_guard=`.
    pub fn stack_guard(&self) -> u64 {
        for entry in &self.apple {
            if let Some(value) = entry.strip_prefix("stack_guard=") {
                let value = value.trim_start_matches("0x");
                if let Ok(seed) = u64::from_str_radix(value, 16) {
                    return seed;
                }
            }
        }
        // No seed (old kernels): derive something nonzero from our own
        // address space layout.
        let probe = 0u8;
        &probe as *const u8 as u64 | 1
    }
}

/// A launched process image graph, ready for control transfer.
pub struct Launched {
    pub linker: Linker,
    pub main: ImageId,
    /// Entry point (from `LC_MAIN`), already slid; `None` for
    /// `LC_UNIXTHREAD` mains, whose register state carries the pc.
    pub entry: Option<u64>,
}

impl std::fmt::Debug for Launched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launched")
            .field("main", &self.main)
            .field("entry", &self.entry)
            .finish()
    }
}

/// Is this process barred from environment controls? Either the kernel
/// says setuid/setgid (and the binary doesn't opt back in), or the main
/// executable carries a `__RESTRICT/__restrict` section.
pub fn is_restricted(args: &BootArgs, main: &MachFile<'_>) -> bool {
    if args.is_setugid && !main.header.flag(header::MH_SETUID_SAFE) {
        return true;
    }
    main.has_restrict_section()
}

fn env_pairs(envp: &[String]) -> impl Iterator<Item = (&str, &str)> {
    envp.iter().filter_map(|entry| entry.split_once('='))
}

/// The full launch sequence: detect restriction, capture the
/// environment, map the shared cache, map the main executable and every
/// inserted library, link the graph, and run initializers.
pub fn launch(args: BootArgs) -> Result<Launched> {
    let main_path = args.executable_path().ok_or_else(|| Error::MalformedImage {
        path: PathBuf::new(),
        reason: "no executable path in apple[] or argv".into(),
    })?;

    // Sniff the main image first: restriction decides whether the
    // environment is honored at all.
    let main_bytes = std::fs::read(&main_path)?;
    let (slice_offset, slice_len) = mach::find_host_slice(&main_bytes, args.host)
        .map_err(|e| crate::image::attach(e, &main_path))?;
    let main_view = MachFile::parse(
        &main_bytes[slice_offset..slice_offset + slice_len],
        args.host,
    )
    .map_err(|e| crate::image::attach(e, &main_path))?;
    let restricted = is_restricted(&args, &main_view);
    let env = EnvConfig::from_env(env_pairs(&args.envp), restricted);
    if env.prints("env") {
        info!(target: "env", "restricted: {}, search config: {:?}", restricted, env.search);
    }
    let force_flat = main_view.header.flag(header::MH_FORCE_FLAT);
    let entropy = args.stack_guard();
    drop(main_view);

    let mut ctx = LinkContext::new(args.host);
    ctx.env = env;
    ctx.env.force_flat_namespace |= force_flat;
    ctx.restricted = restricted;
    ctx.entropy = entropy;
    ctx.vars = ProgramVars {
        argv: args.argv.clone(),
        envp: args.envp.clone(),
        apple: args.apple.clone(),
    };
    let mut linker = Linker::new(ctx);

    // Shared cache, per policy.
    if linker.ctx.env.shared_region != SharedRegionMode::Avoid {
        if let Some(dir) = &args.cache_dir {
            let arch = cputype::arch_name(args.host.0, args.host.1);
            let cache_path = cache::cache_path_for_arch(dir, arch);
            if cache_path.exists() {
                match SharedCache::map(&cache_path, arch, linker.ctx.env.shared_region) {
                    Ok(cache) => {
                        linker.registry.debugger.shared_cache_base =
                            (cache.images().first().map(|i| i.unslid_address).unwrap_or(0)
                                as i64
                                + cache.slide()) as u64;
                        linker.registry.debugger.shared_cache_slide = cache.slide();
                        linker.registry.debugger.shared_cache_uuid = cache.uuid;
                        linker.cache = Some(cache);
                    }
                    Err(err) => {
                        warn!(target: "warnings", "shared cache unusable: {}", err);
                    }
                }
            }
        }
    }

    // Map the main executable.
    let main_file = File::open(&main_path)?;
    let main_meta = main_file.metadata()?;
    let opts = LoadOptions {
        host: args.host,
        entropy: linker.ctx.next_entropy(0),
        flags: ImageFlags::NEVER_UNLOAD,
    };
    let main_image = Image::load_from_file(&main_path, &main_file, &main_meta, &opts)?;
    drop(main_file);
    let entry = main_image.entry;
    let main_id = linker.registry.add(main_image);
    linker.main_image = Some(main_id);
    linker.stats.images_loaded += 1;

    // Inserted libraries map before the main image's dependencies and
    // precede it in flat lookups.
    let inserted_paths = linker.ctx.env.insert_libraries.clone();
    for path in inserted_paths {
        match load_inserted(&mut linker, &path) {
            Ok(id) => linker.inserted.push(id),
            Err(err) => {
                // dyld treats a bad insert as fatal; so do we.
                return Err(err);
            }
        }
    }

    // Link the whole launch graph: the main executable plus every
    // inserted root. The sequence registers and applies the inserted
    // libraries' interposing once they are all bound, and weak-binds
    // only after that.
    let mut roots = vec![main_id];
    roots.extend(linker.inserted.iter().copied());
    linker.link_roots(&roots, false)?;

    // Initializers: inserted libraries first, then main.
    linker.initialize_main_executable()?;

    Ok(Launched {
        linker,
        main: main_id,
        entry,
    })
}

fn load_inserted(linker: &mut Linker, path: &Path) -> Result<ImageId> {
    let meta = std::fs::metadata(path).map_err(|err| Error::MissingLibrary {
        name: path.display().to_string(),
        referenced_from: PathBuf::new(),
        reason: err.to_string(),
    })?;
    let file = File::open(path)?;
    let opts = LoadOptions {
        host: linker.ctx.host,
        entropy: linker.ctx.next_entropy(linker.registry.len() as u64 + 1),
        flags: ImageFlags::INSERTED | ImageFlags::NEVER_UNLOAD,
    };
    let image = Image::load_from_file(path, &file, &meta, &opts)?;
    drop(file);
    let id = linker.registry.add(image);
    linker.stats.images_loaded += 1;
    info!(target: "libraries", "inserted {:?}", path);
    Ok(id)
}

///////////////////////////////////////////
// Halt channel
///////////////////////////////////////////

/// The globally-addressable message a crash reporter reads after an
/// aborted launch.
pub static LAST_LAUNCH_ERROR: Mutex<String> = Mutex::new(String::new());

/// Termination flags word set before the abort thunk runs.
pub static TERMINATION_FLAGS: AtomicU32 = AtomicU32::new(0);

pub const TERMINATION_BY_DYLD: u32 = 1;

type AbortThunk = fn(&str) -> !;

fn default_abort(message: &str) -> ! {
    eprintln!("dyld: {}", message);
    std::process::abort();
}

static ABORT_THUNK: AtomicUsize = AtomicUsize::new(0);

/// Replace the abort thunk (crash-report glue, tests).
pub fn set_abort_thunk(thunk: AbortThunk) {
    ABORT_THUNK.store(thunk as usize, Ordering::SeqCst);
}

/// Compose the halt message ("what were we doing" plus the error),
/// publish it for crash reporting, and invoke the abort thunk.
pub fn halt(linker: Option<&mut Linker>, err: &Error) -> ! {
    let mut message = String::new();
    if let Some(linker) = linker {
        if !linker.phase_note().is_empty() {
            message.push_str(linker.phase_note());
            message.push_str(": ");
        }
        message.push_str(&err.to_string());
        linker.registry.debugger.record_error(DebuggerErrorInfo {
            kind: err.kind(),
            referencing_image: None,
            target_image: None,
            symbol: None,
            message: message.clone(),
        });
    } else {
        message.push_str(&err.to_string());
    }
    if let Ok(mut slot) = LAST_LAUNCH_ERROR.lock() {
        *slot = message.clone();
    }
    TERMINATION_FLAGS.store(TERMINATION_BY_DYLD, Ordering::SeqCst);
    let raw = ABORT_THUNK.load(Ordering::SeqCst);
    if raw != 0 {
        let thunk: AbortThunk = unsafe { std::mem::transmute(raw) };
        thunk(&message)
    } else {
        default_abort(&message)
    }
}

/// Launch, halting the process through the abort channel on any error.
pub fn launch_or_halt(args: BootArgs) -> Launched {
    match launch(args) {
        Ok(launched) => launched,
        Err(err) => halt(None, &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apple_vector_parsing() {
        let mut args = BootArgs::new((0, 0));
        args.apple = vec![
            "executable_path=/bin/thing".into(),
            "stack_guard=0xdeadbeef00112233".into(),
        ];
        args.argv = vec!["thing".into()];
        assert_eq!(args.executable_path(), Some(PathBuf::from("/bin/thing")));
        assert_eq!(args.stack_guard(), 0xdead_beef_0011_2233);

        args.apple.clear();
        assert_eq!(args.executable_path(), Some(PathBuf::from("thing")));
        assert_ne!(args.stack_guard(), 0);
    }
}

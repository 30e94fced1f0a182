//! A Mach-O dynamic linker core.
//!
//! This crate implements the user-space half of program launch for Mach-O
//! binaries: given a main executable, it maps every required shared library,
//! applies rebases, resolves symbolic references between images, runs
//! initializers in dependency order, and hands back the entry point. After
//! launch it services lazy symbol resolution on first call and runtime
//! load/unload of additional images.
//!
//! The major pieces, bottom up:
//!
//! - [`mach`]: endian- and width-aware accessors over raw mapped Mach-O
//!   bytes: headers, load commands, segments, nlist symbol tables, fat
//!   containers.
//! - [`linkedit`]: interpreters and emitters for the compressed LINKEDIT
//!   opcode streams (rebase, bind, lazy bind, weak bind) and the export
//!   trie.
//! - [`segment`]: address-space reservation, slide selection, and
//!   per-segment mapping with protection management.
//! - [`image`]: the per-image state machine: identity, dependency table,
//!   reference counts, and the link phases (`mapped` through
//!   `initialized`).
//! - [`paths`]: `@executable_path`/`@loader_path`/`@rpath` expansion and
//!   the framework/library search and fallback order.
//! - [`registry`]: the process-wide image set, with a lock-free
//!   address-range index and the debugger-visible image list.
//! - [`context`]: the orchestrator: drives the phase sequence across a
//!   dependency graph, coalesces weak symbols, applies interposition, and
//!   garbage-collects unreachable images on unload.
//! - [`cache`]: the shared-cache consumer: maps the prebuilt cache for
//!   the host architecture and advertises the dylibs inside it.
//! - [`lazy`]: the stub-miss binder invoked on first call through a lazy
//!   pointer.
//! - [`boot`]: program-launch plumbing: argv/envp/apple parsing,
//!   restricted-process detection, inserted libraries, and the launch link
//!   of the main executable.
//!
//! Everything observable flows through a [`context::Linker`], the single
//! process-wide state value; image operations receive an immutable
//! [`context::LinkContext`] view of the configuration they need.

pub mod boot;
pub mod cache;
pub mod container;
pub mod context;
pub mod error;
pub mod image;
pub mod lazy;
pub mod linkedit;
pub mod mach;
pub mod paths;
pub mod registry;
pub mod segment;
pub mod strtab;

pub use crate::error::{Error, Result};

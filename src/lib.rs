//! Filament spool NFC tags: decode what is on the tag, bind it to a spool
//! in the inventory and activate that spool on the printer.
//!
//! The pieces, in pipeline order:
//!
//! - [`sniffer`] picks one decode path per tag ([`codec`] for binary
//!   records, [`text`] for `SPOOL:`/`FILAMENT:` text, or the bare hardware
//!   identifier).
//! - [`mapping`] turns decoded fields into inventory record fields.
//! - [`reconcile`] looks up or creates vendor, filament and spool through an
//!   [`inventory::Repository`].
//! - [`dispatch`] sends the resolved identity to the printer.
//! - [`scan`] runs the above once per tag event and publishes the state that
//!   the `ipc` socket serves.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inventory;
#[cfg(unix)]
pub mod ipc;
pub mod mapping;
pub mod reconcile;
pub mod scan;
pub mod sniffer;
pub mod tag;
pub mod text;

pub use codec::BinaryFormat;
pub use config::Config;
pub use error::{DecodeError, EncodeError, ReconcileError, RepositoryError, ScanError};
pub use reconcile::{Reconciler, ResolvedSpoolIdentity};
pub use scan::{ScanService, ScanState, TagEvent, TagSource};
pub use sniffer::{DecodedTag, Sniffer, TagFormat};
pub use tag::{NfcId, RawTagPayload, TagRecord};

/// Log to stderr, filtered by `RUST_LOG`, else `debug` when verbose and
/// `info` otherwise.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

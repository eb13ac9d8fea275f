//! Transport Factory (§4.7): the construction entry points a server or
//! client uses to get a [`TransportEndpoint`], kept separate from
//! `transport-shm` so endpoint construction has one obvious front door and
//! the initialization-order rule in §9 ("logger -> loop -> factory ->
//! endpoints") has something to name.

use tracing::{error, info};
use transport_error::TransportError;
use transport_shm::{TransportEndpoint, TransportInfo};

pub struct TransportFactory;

impl TransportFactory {
    /// Server-side construction (§4.2) with the source's default per-ring
    /// data size (§3.5).
    pub fn new(max_inputs: u32, max_outputs: u32) -> Result<TransportEndpoint, TransportError> {
        let endpoint = TransportEndpoint::new_server(max_inputs, max_outputs).map_err(|e| {
            error!(error = %e, max_inputs, max_outputs, "failed to construct transport endpoint");
            e
        })?;
        info!(max_inputs, max_outputs, "transport endpoint constructed");
        Ok(endpoint)
    }

    /// As [`TransportFactory::new`], but with an explicit per-ring data size
    /// (e.g. from `DaemonConfig::ring_size`).
    pub fn new_with_ring_size(max_inputs: u32, max_outputs: u32, ring_size: u32) -> Result<TransportEndpoint, TransportError> {
        let endpoint = TransportEndpoint::new_server_with_ring_size(max_inputs, max_outputs, ring_size).map_err(|e| {
            error!(error = %e, max_inputs, max_outputs, ring_size, "failed to construct transport endpoint");
            e
        })?;
        info!(max_inputs, max_outputs, ring_size, "transport endpoint constructed");
        Ok(endpoint)
    }

    /// Client-side attach. `info` is `{memfd, offset, size}` received over a
    /// side-channel; attach failures surface as `MAP_FAILED`/`PROTOCOL`
    /// without consuming anything beyond the passed fd.
    pub fn new_from_info(info: TransportInfo) -> Result<TransportEndpoint, TransportError> {
        let size = info.size;
        let endpoint = TransportEndpoint::attach_client(info.memfd, info.offset, info.size).map_err(|e| {
            error!(error = %e, size, "failed to attach transport endpoint");
            e
        })?;
        info!(size, "transport endpoint attached");
        Ok(endpoint)
    }
}

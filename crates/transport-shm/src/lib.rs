//! Shared memory region layout, control-record framing, and the
//! direction-neutral transport endpoint built on top of them (§3, §4.2).

pub mod endpoint;
pub mod layout;
pub mod record;

pub use endpoint::{Role, SharedRegion, TransportEndpoint, TransportInfo};
pub use layout::{AreaHeader, PortIo, PortStatus, RegionLayout, AREA_VERSION, INVALID_BUFFER_ID, RING_DATA_SIZE};
pub use record::{RecordHeader, RECORD_HEADER_SIZE};

#[cfg(test)]
mod tests {
    use super::*;

    fn paired(max_inputs: u32, max_outputs: u32) -> (TransportEndpoint, TransportEndpoint) {
        let server = TransportEndpoint::new_server(max_inputs, max_outputs).unwrap();
        let info = server.info().unwrap();
        let client = TransportEndpoint::attach_client(info.memfd, info.offset, info.size).unwrap();
        (server, client)
    }

    #[test]
    fn server_and_client_pick_opposite_physical_rings() {
        let (server, client) = paired(1, 1);
        assert_eq!(server.role(), Role::Server);
        assert_eq!(client.role(), Role::Client);
    }

    #[test]
    fn event_written_by_server_is_read_by_client() {
        let (mut server, mut client) = paired(1, 1);
        server.add_event(7, b"hello").unwrap();

        let header = client.next_event().unwrap();
        assert_eq!(header.ty, 7);
        assert_eq!(header.size, 5);

        let mut body = [0u8; 5];
        client.parse_event(&mut body).unwrap();
        assert_eq!(&body, b"hello");

        assert!(matches!(client.next_event(), Err(transport_error::TransportError::EnumEnd)));
    }

    #[test]
    fn event_written_by_client_is_read_by_server() {
        let (mut server, mut client) = paired(1, 1);
        client.add_event(3, b"ping").unwrap();

        let header = server.next_event().unwrap();
        assert_eq!(header.ty, 3);
        let mut body = [0u8; 4];
        server.parse_event(&mut body).unwrap();
        assert_eq!(&body, b"ping");
    }

    #[test]
    fn add_event_larger_than_ring_is_rejected_without_partial_write() {
        let (mut server, mut client) = paired(1, 1);
        let oversized = vec![0u8; RING_DATA_SIZE as usize + 1];
        let err = server.add_event(1, &oversized).unwrap_err();
        assert!(matches!(err, transport_error::TransportError::NoSpace { .. }));
        assert!(matches!(
            client.next_event(),
            Err(transport_error::TransportError::EnumEnd)
        ));
    }

    #[test]
    fn parse_event_rejects_dst_length_mismatch() {
        let (mut server, mut client) = paired(1, 1);
        server.add_event(1, b"abcd").unwrap();
        client.next_event().unwrap();
        let mut wrong = [0u8; 3];
        let err = client.parse_event(&mut wrong).unwrap_err();
        assert!(matches!(err, transport_error::TransportError::InvalidArguments(_)));
    }

    #[test]
    fn port_io_slots_start_idle_and_are_independent_per_index() {
        let (server, _client) = paired(2, 2);
        server.add_input_port(0).unwrap();
        server.add_input_port(1).unwrap();
        let p0 = server.input_port(0).unwrap();
        let p1 = server.input_port(1).unwrap();
        assert_eq!(p0.status(), PortStatus::Ok);
        assert_eq!(p0.buffer_id(), None);

        p0.set_buffer_id(Some(42));
        assert_eq!(p0.buffer_id(), Some(42));
        assert_eq!(p1.buffer_id(), None);

        assert!(server.input_port(2).is_none());
        assert!(server.output_port(2).is_none());
    }

    #[test]
    fn buffer_id_writes_are_ignored_before_add_and_after_remove() {
        let (server, _client) = paired(1, 1);
        let p0 = server.input_port(0).unwrap();

        // Not yet added: writes are ignored.
        p0.set_buffer_id(Some(1));
        assert_eq!(p0.buffer_id(), None);

        server.add_input_port(0).unwrap();
        p0.set_buffer_id(Some(7));
        assert_eq!(p0.buffer_id(), Some(7));

        server.remove_input_port(0).unwrap();
        assert_eq!(p0.buffer_id(), None, "remove clears any presented buffer");
        p0.set_buffer_id(Some(9));
        assert_eq!(p0.buffer_id(), None, "retired slots ignore further writes");
    }

    #[test]
    fn add_and_remove_port_reject_out_of_range_and_double_transitions() {
        let (server, _client) = paired(1, 1);
        assert!(server.add_input_port(1).is_err(), "out of range");
        assert!(server.remove_input_port(0).is_err(), "not yet added");

        server.add_input_port(0).unwrap();
        assert!(server.add_input_port(0).is_err(), "already added");

        server.remove_input_port(0).unwrap();
        assert!(server.remove_input_port(0).is_err(), "already retired");
        assert!(server.add_input_port(0).is_err(), "retired slots do not reopen");
    }

    #[test]
    fn attach_rejects_size_mismatch() {
        let server = TransportEndpoint::new_server(1, 1).unwrap();
        let info = server.info().unwrap();
        let err = SharedRegion::attach(info.memfd, info.offset, info.size - 8).unwrap_err();
        assert!(matches!(err, transport_error::TransportError::Protocol));
    }

    #[test]
    fn create_with_ring_size_rejects_non_power_of_two() {
        let err = SharedRegion::create_with_ring_size(1, 1, 100).unwrap_err();
        assert!(matches!(err, transport_error::TransportError::InvalidArguments(_)));
    }

    /// A peer that reports a non-power-of-two `ring_size` must be rejected
    /// with `Protocol`, not panic `RegionLayout::new`'s assert (there is no
    /// longer one to trip, but this pins the caller-facing behavior).
    #[test]
    fn attach_rejects_non_power_of_two_ring_size_without_panicking() {
        use transport_mmap::{AttachedMmap, MappedRegion};

        let server = TransportEndpoint::new_server(1, 1).unwrap();
        let info_for_corruption = server.info().unwrap();
        let info_for_attach = server.info().unwrap();

        let mut mm =
            AttachedMmap::from_fd(info_for_corruption.memfd, info_for_corruption.offset, info_for_corruption.size).unwrap();
        let base = mm.base_ptr();
        // AreaHeader's `ring_size` field sits right after
        // version/max_inputs/n_inputs/max_outputs/n_outputs (4 x u32 = 20 bytes in).
        unsafe {
            std::ptr::write(base.add(20) as *mut u32, 100u32);
        }
        drop(mm);

        let err = SharedRegion::attach(info_for_attach.memfd, info_for_attach.offset, info_for_attach.size).unwrap_err();
        assert!(matches!(err, transport_error::TransportError::Protocol));
    }
}

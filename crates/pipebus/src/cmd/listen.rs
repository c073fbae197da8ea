use pipebus_bus::{flag, BusConfig, BusError, MessageBus, ReadStatus};
use pipebus_transport::UdsListener;

use crate::cmd::ListenArgs;
use crate::exit::{bus_error, io_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_packet, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener =
        UdsListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    let conn = listener
        .accept()
        .map_err(|err| transport_error("accept failed", err))?;

    let config = BusConfig {
        buffer_size: args.buffer_size,
        ..BusConfig::default()
    };
    let mut bus = MessageBus::new(config).map_err(|err| bus_error("bus setup failed", err))?;
    bus.init_pipe_socket(conn.fd())
        .map_err(|err| bus_error("pipe registration failed", err))?;
    let sock = match bus.pipe_socket(conn.fd()) {
        Some(sock) => sock.as_borrowed(),
        None => return Err(CliError::new(INTERNAL, "pipe socket not registered")),
    };

    let mut seen = 0usize;
    loop {
        match bus.read(&sock) {
            Ok(ReadStatus::Pending) => {
                sock.wait_readable(-1)
                    .map_err(|err| io_error("poll failed", err))?;
            }
            Ok(ReadStatus::Ready(_)) => {
                let info = *bus.header();
                if let Some(payload) = bus.get_packet() {
                    print_packet(&info, payload, format);
                }
                if info.flags & flag::OBJ_PTR != 0 {
                    // Release the reassembled buffer back to the allocator.
                    let _ = bus.move_packet();
                }
                seen += 1;
                if args.count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
            Err(BusError::PeerClosed { .. }) => break,
            Err(err) => return Err(bus_error("receive failed", err)),
        }
    }

    Ok(SUCCESS)
}

use std::fs;

use pipebus_bus::{BusConfig, MessageBus, SendData};
use pipebus_transport::UdsListener;

use crate::cmd::SendArgs;
use crate::exit::{bus_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_sent, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = resolve_payload(&args)?;

    let config = BusConfig {
        buffer_size: args.buffer_size,
        always_chunked: args.always_chunked,
        ..BusConfig::default()
    };
    let mut bus = MessageBus::new(config).map_err(|err| bus_error("bus setup failed", err))?;

    let sock =
        UdsListener::connect(&args.path).map_err(|err| transport_error("connect failed", err))?;

    let mut resp = SendData::new(args.kind, &payload);
    bus.write(&sock, &mut resp)
        .map_err(|err| bus_error("send failed", err))?;

    print_sent(resp.info.msg_id, args.kind, payload.len(), format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> SendArgs {
        SendArgs {
            path: "/tmp/test.sock".into(),
            kind: 0,
            json: None,
            data: None,
            file: None,
            buffer_size: 65536,
            always_chunked: false,
        }
    }

    #[test]
    fn data_payload_is_passed_through() {
        let mut args = base_args();
        args.data = Some("hello".into());
        assert_eq!(resolve_payload(&args).unwrap(), b"hello");
    }

    #[test]
    fn json_payload_is_validated() {
        let mut args = base_args();
        args.json = Some("{not json".into());
        let err = resolve_payload(&args).unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn missing_payload_defaults_to_empty() {
        assert!(resolve_payload(&base_args()).unwrap().is_empty());
    }
}

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

pub const CLIENT_TO_SERVER_CAP: usize = 65_536;
pub const SERVER_TO_CLIENT_CAP: usize = 4_194_304;

pub const ENABLE_NAVIGATION_INTERCEPTION: &str =
    "Circuit._internal.uriHelper.enableNavigationInterception";
pub const NAVIGATE_TO: &str = "Circuit._internal.uriHelper.navigateTo";
pub const ATTACH_ROOT_COMPONENT: &str = "Circuit._internal.attachRootComponentToElement";
pub const END_INVOKE_DOTNET: &str = "DotNet.jsCallDispatcher.endInvokeDotNetFromJS";

/// Messages sent by the remote renderer to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum HubEnvelope {
    #[serde(rename = "start_circuit")]
    StartCircuit { uri: String, base_uri: String },

    #[serde(rename = "begin_invoke_dotnet")]
    BeginInvokeDotNet {
        #[serde(default)]
        call_id: Option<String>,
        module: String,
        method: String,
        args_json: String,
    },

    #[serde(rename = "end_invoke_js")]
    EndInvokeJs {
        handle: u64,
        succeeded: bool,
        #[serde(default)]
        result_json: String,
    },
}

/// Messages sent by the server to the remote renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum ClientEnvelope {
    #[serde(rename = "render_batch")]
    RenderBatch {
        renderer_id: u32,
        batch_id: u64,
        batch: String,
    },

    #[serde(rename = "begin_invoke_js")]
    BeginInvokeJs {
        handle: u64,
        identifier: String,
        args_json: String,
    },

    #[serde(rename = "circuit_started")]
    CircuitStarted { circuit_id: String, renderer_id: u32 },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ClientEnvelope {
    pub fn method_name(&self) -> &'static str {
        match self {
            ClientEnvelope::RenderBatch { .. } => "JS.RenderBatch",
            ClientEnvelope::BeginInvokeJs { .. } => "JS.BeginInvokeJS",
            ClientEnvelope::CircuitStarted { .. } => "StartCircuit.Completed",
            ClientEnvelope::Error { .. } => "JS.Error",
        }
    }
}

pub fn render_batch_envelope(renderer_id: u32, batch_id: u64, bytes: &[u8]) -> ClientEnvelope {
    ClientEnvelope::RenderBatch {
        renderer_id,
        batch_id,
        batch: BASE64.encode(bytes),
    }
}

pub fn begin_invoke_js_envelope(
    handle: u64,
    identifier: impl Into<String>,
    args_json: impl Into<String>,
) -> ClientEnvelope {
    ClientEnvelope::BeginInvokeJs {
        handle,
        identifier: identifier.into(),
        args_json: args_json.into(),
    }
}

pub fn circuit_started_envelope(circuit_id: impl ToString, renderer_id: u32) -> ClientEnvelope {
    ClientEnvelope::CircuitStarted {
        circuit_id: circuit_id.to_string(),
        renderer_id,
    }
}

pub fn error_envelope(code: impl Into<String>, message: impl Into<String>) -> ClientEnvelope {
    ClientEnvelope::Error {
        code: code.into(),
        message: message.into(),
    }
}

pub fn decode_batch_payload(batch: &str) -> io::Result<Vec<u8>> {
    BASE64
        .decode(batch)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn writer_loop<W: Write>(rx: Receiver<ClientEnvelope>, mut writer: W) -> io::Result<()> {
    for envelope in rx {
        let payload = encode_client_envelope(&envelope)?;
        write_frame(&mut writer, &payload, SERVER_TO_CLIENT_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

/// Feeds every inbound envelope to `on_envelope` until the stream ends.
///
/// Frames that are oversized or fail to decode go to `on_malformed` and the
/// loop keeps reading; only I/O failures end it.
pub fn reader_loop<R, F, M>(mut reader: R, mut on_envelope: F, mut on_malformed: M) -> io::Result<()>
where
    R: Read,
    F: FnMut(HubEnvelope),
    M: FnMut(io::Error),
{
    loop {
        let payload = match read_frame(&mut reader, CLIENT_TO_SERVER_CAP) {
            Ok(payload) => payload,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                on_malformed(err);
                continue;
            }
            Err(err) => return Err(err),
        };

        match decode_hub_envelope(&payload) {
            Ok(envelope) => on_envelope(envelope),
            Err(err) => on_malformed(err),
        }
    }
}

pub fn encode_client_envelope(envelope: &ClientEnvelope) -> io::Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(json_error)
}

pub fn decode_hub_envelope(payload: &[u8]) -> io::Result<HubEnvelope> {
    serde_json::from_slice(payload).map_err(json_error)
}

/// Reads one length-prefixed frame. A frame over `max_payload` is consumed and
/// reported as `InvalidData`, leaving the reader at the next length prefix.
pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut prefix = [0_u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);

    if let Err(err) = checked_len(len as usize, max_payload) {
        let skipped = io::copy(&mut (&mut *reader).take(u64::from(len)), &mut io::sink())?;
        if skipped < u64::from(len) {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        return Err(err);
    }

    let mut payload = vec![0_u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    let len = checked_len(payload.len(), max_payload)?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)
}

fn checked_len(len: usize, max_payload: usize) -> io::Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|_| len <= max_payload)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds the {max_payload} byte limit"),
            )
        })
}

fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

//! Commands slicers publish to the request topic.

use serde_json::Value;

use crate::ftp::sanitize_filename;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `pushing.pushall`: send a status snapshot now.
    PushAll,
    /// `info.get_version`: send the module table.
    GetVersion { sequence_id: String },
    /// `print.project_file`: start printing an uploaded job.
    ProjectFile {
        sequence_id: String,
        filename: String,
        payload: Value,
    },
    Pause { sequence_id: String },
    Resume { sequence_id: String },
    Stop { sequence_id: String },
    /// Any other `print` command; acknowledged and otherwise ignored.
    OtherPrint { command: String, sequence_id: String },
}

/// Sequence ids arrive as strings or numbers; replies echo them as strings.
fn sequence_id(section: &Value) -> String {
    match section.get("sequence_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_string(),
    }
}

/// Name of the job a `project_file` command refers to.
///
/// Slicers put it in `url` (`ftp://`, `file:///sdcard/...`) and repeat the
/// stem in `subtask_name`; the URL wins when both are present.
fn project_filename(print: &Value) -> String {
    let from_url = print
        .get("url")
        .and_then(Value::as_str)
        .and_then(sanitize_filename);
    from_url
        .or_else(|| {
            print
                .get("file")
                .and_then(Value::as_str)
                .and_then(sanitize_filename)
        })
        .or_else(|| {
            print
                .get("subtask_name")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Parse a request payload. `None` for payloads that are not JSON objects or
/// carry no known section.
pub fn parse_request(payload: &[u8]) -> Option<Request> {
    let value: Value = serde_json::from_slice(payload).ok()?;

    if let Some(pushing) = value.get("pushing") {
        return (pushing.get("command").and_then(Value::as_str) == Some("pushall"))
            .then_some(Request::PushAll);
    }
    if let Some(info) = value.get("info") {
        return (info.get("command").and_then(Value::as_str) == Some("get_version")).then(|| {
            Request::GetVersion {
                sequence_id: sequence_id(info),
            }
        });
    }

    let print = value.get("print")?;
    let command = print.get("command").and_then(Value::as_str)?;
    let sequence_id = sequence_id(print);
    let request = match command {
        "project_file" => Request::ProjectFile {
            filename: project_filename(print),
            sequence_id,
            payload: value.clone(),
        },
        "pause" => Request::Pause { sequence_id },
        "resume" => Request::Resume { sequence_id },
        "stop" => Request::Stop { sequence_id },
        other => Request::OtherPrint {
            command: other.to_string(),
            sequence_id,
        },
    };
    Some(request)
}

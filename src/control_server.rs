// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Out-of-band control endpoint. Clients connect to the daemon's unix
//! socket, send one command per line, and read back one JSON-encoded reply
//! per line. The daemon decides the command set; this module only owns the
//! framing.

use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;

use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::prelude::*;
use crate::utils;

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "status", content = "payload")]
enum ControlReply {
    Ok(String),
    Err(String),
}

fn serve_connection<F: Fn(&str) -> Result<String>>(stream: UnixStream, handler: F) -> Result<()> {
    let reader = BufReader::new(stream.try_clone().location(loc!())?);
    let mut writer = BufWriter::new(stream);
    for line in reader.lines() {
        let command = line.context(loc!(), "reading control command")?;
        let reply = match handler(&command) {
            Ok(payload) => ControlReply::Ok(payload),
            Err(e) => ControlReply::Err(format!("{e:?}")),
        };
        serde_json::to_writer(&mut writer, &reply).location(loc!())?;
        writer.write_all(b"\n").location(loc!())?;
        writer.flush().location(loc!())?;
    }
    debug!("control connection closed by peer");
    Ok(())
}

/// Binds `sock_path` and serves `handler` from a background thread, one
/// thread per accepted connection. The handler sees each command with its
/// newline stripped; its reply gets the newline appended after encoding.
pub fn start<P, F>(sock_path: P, handler: F) -> Result<()>
where
    P: AsRef<Path>,
    F: Fn(&str) -> Result<String> + Send + Sync + Clone + 'static,
{
    let listener = utils::bind_control_socket(sock_path.as_ref()).location(loc!())?;

    thread::Builder::new()
        .name("farmem-control".to_string())
        .spawn(move || {
            for stream in listener.incoming() {
                let stream = log_and_continue!(stream.location(loc!()));
                let handler = handler.clone();
                thread::spawn(move || {
                    if let Err(e) = serve_connection(stream, handler) {
                        warn!("control connection failed: {e:?}");
                    }
                });
            }
        })
        .location(loc!())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_command_reply_roundtrip() {
        let dir = std::env::temp_dir().join(format!("farmem-ctrl-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let sock = dir.join("ctrl.sock");

        start(&sock, |cmd: &str| {
            if cmd == "ping" {
                Ok("pong".to_string())
            } else {
                bail!("unknown command {cmd}")
            }
        })
        .unwrap();

        let stream = UnixStream::connect(&sock).unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        writer.write_all(b"ping\n").unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let reply: ControlReply = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(reply, ControlReply::Ok("pong".to_string()));

        writer.write_all(b"nope\n").unwrap();
        line.clear();
        reader.read_line(&mut line).unwrap();
        let reply: ControlReply = serde_json::from_str(line.trim_end()).unwrap();
        assert!(matches!(reply, ControlReply::Err(_)));

        fs::remove_dir_all(&dir).unwrap();
    }
}

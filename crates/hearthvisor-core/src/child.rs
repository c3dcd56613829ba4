use crate::error::SpawnError;
use crate::process::{LaunchSpec, Launched, OutputStream, ProcessExit, ProcessHandle, ProcessId};
use anyhow::Result;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio_stream::StreamExt;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

/// Longest captured output line; longer lines are cut and flagged with [`TRUNCATED_SUFFIX`]
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Appended to a line cut at [`MAX_LINE_LENGTH`]
pub const TRUNCATED_SUFFIX: &str = " [truncated]";

/// Process handle backed by a tokio child process
pub struct ChildProcessHandle {
    child: Child,
    pid: Option<ProcessId>,
    command: String,
}

impl ChildProcessHandle {
    pub fn new(child: Child, command: String) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            command,
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcessHandle {
    fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    fn command(&self) -> &str {
        &self.command
    }

    async fn try_wait(&mut self) -> Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(ProcessExit::from))
    }
}

/// Apply the launch spec to `cmd` and spawn it with closed stdin and piped output.
///
/// Platform crates configure process groups or creation flags on `cmd` before calling this.
pub fn launch_command(
    mut cmd: Command,
    spec: &LaunchSpec,
) -> Result<Launched<ChildProcessHandle>, SpawnError> {
    cmd.args(&spec.args);

    if let Some(dir) = &spec.working_directory {
        cmd.current_dir(dir);
    }

    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SpawnError {
        service: spec.name.clone(),
        command: spec.command.clone(),
        source,
    })?;

    let stdout = child.stdout.take().map(lines);
    let stderr = child.stderr.take().map(lines);

    Ok(Launched {
        handle: ChildProcessHandle::new(child, spec.command.clone()),
        stdout,
        stderr,
    })
}

fn lines<R: AsyncRead + Send + 'static>(io: R) -> OutputStream {
    let frames = FramedRead::new(io, OutputLineCodec::new(MAX_LINE_LENGTH));
    Box::pin(frames.map_while(|line| line.ok()))
}

/// Splits child output into lines without ever failing on content.
///
/// Invalid UTF-8 is replaced, and a line longer than `max_length` is emitted cut short
/// while the rest of it is discarded up to the next newline. The pipe keeps being
/// drained either way, so a chatty child never blocks or dies on a closed pipe.
#[derive(Debug)]
struct OutputLineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline
    next_index: usize,
    /// Inside the tail of a truncated line
    discarding: bool,
}

impl OutputLineCodec {
    fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for OutputLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|offset| self.next_index + offset);

            match newline {
                Some(end) if self.discarding => {
                    buf.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                None if self.discarding => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                Some(end) if end <= self.max_length => {
                    let line = buf.split_to(end + 1);
                    self.next_index = 0;
                    return Ok(Some(text(&line[..end])));
                }
                _ if buf.len() > self.max_length => {
                    let head = buf.split_to(self.max_length);
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(format!("{}{TRUNCATED_SUFFIX}", text(&head))));
                }
                _ => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(text(&rest)))
    }
}

fn text(bytes: &[u8]) -> String {
    let line = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut OutputLineCodec, chunks: &[&[u8]]) -> Vec<String> {
        let mut buf = BytesMut::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            while let Some(line) = codec.decode(&mut buf).unwrap() {
                lines.push(line);
            }
        }
        while let Some(line) = codec.decode_eof(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_lines_split_across_reads() {
        let mut codec = OutputLineCodec::new(64);
        let lines = decode_all(&mut codec, &[b"boot", b"ing\r\nready\n", b"tail"]);
        assert_eq!(lines, vec!["booting", "ready", "tail"]);
    }

    #[test]
    fn test_long_line_is_cut_and_decoding_continues() {
        let mut codec = OutputLineCodec::new(8);
        let lines = decode_all(
            &mut codec,
            &[b"0123456789", b"abcdef", b"ghij\nnext\n", b"exactly8\n"],
        );
        assert_eq!(
            lines,
            vec![
                format!("01234567{TRUNCATED_SUFFIX}"),
                "next".to_string(),
                "exactly8".to_string(),
            ]
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = OutputLineCodec::new(64);
        let lines = decode_all(&mut codec, &[b"caf\xff\n"]);
        assert_eq!(lines, vec!["caf\u{fffd}"]);
    }
}

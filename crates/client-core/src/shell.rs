//! Shell subprocess plumbing.

use std::process::Stdio;

use futures_util::stream::{select, Select};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::io::ReaderStream;

use crate::ClientResult;

type OutStream = ReaderStream<tokio::process::ChildStdout>;
type ErrStream = ReaderStream<tokio::process::ChildStderr>;

/// A spawned shell with its stdio ready for wiring to the controller.
///
/// It need not actually be a "real" shell; any subprocess which talks on
/// stdio will do.
pub struct CmdShell {
    /// The running subprocess.
    pub child: Child,
    /// The shell's stdin; operator input goes here.
    pub stdin: ChildStdin,
    /// The shell's stdout and stderr, interleaved, as one byte stream.
    pub output: Select<OutStream, ErrStream>,
}

impl CmdShell {
    /// Spawn `argv` with all three stdio streams piped.
    pub fn spawn(argv: &[String]) -> ClientResult<Self> {
        let Some((program, args)) = argv.split_first() else {
            return Err(std::io::Error::other("empty argv").into());
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = take_io(child.stdin.take())?;
        let stdout = take_io(child.stdout.take())?;
        let stderr = take_io(child.stderr.take())?;

        Ok(Self {
            child,
            stdin,
            output: select(ReaderStream::new(stdout), ReaderStream::new(stderr)),
        })
    }
}

fn take_io<T>(io: Option<T>) -> ClientResult<T> {
    io.ok_or_else(|| {
        std::io::Error::other("subprocess stdio was not piped").into()
    })
}

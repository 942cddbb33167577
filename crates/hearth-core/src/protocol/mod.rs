//! Line-oriented wire protocol between build clients and the build server.
//!
//! Each connection carries exactly one exchange:
//!
//! 1. The client sends the argument count, then one argument per line.
//! 2. The server streams `<LEVEL>:<text>` log lines while it works.
//! 3. The server finishes with a single `RC:<code>` line.
//!
//! A connection that closes before step 3 is reported as
//! [`ERROR_EXIT_CODE`] rather than as an error, since a server dying
//! mid-request is an expected failure mode.

mod codec;
mod line;
mod sink;

pub use codec::{read_command, read_response, send_command, send_exit_code, send_log};
pub use line::{CompileResult, LineKind, LogLevel, ProtocolLine, ERROR_EXIT_CODE, RC_TAG};
pub use sink::{LogSink, TracingSink};

use crate::Result;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Run one request/response cycle over an established stream.
pub async fn exchange<T, A, S>(stream: &mut T, args: &[A], sink: &mut S) -> Result<i32>
where
    T: AsyncRead + AsyncWrite + Unpin,
    A: AsRef<str>,
    S: LogSink + ?Sized,
{
    send_command(stream, args).await?;
    let mut reader = BufReader::new(stream);
    read_response(&mut reader, sink).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_over_duplex() {
        let (mut client, server) = tokio::io::duplex(256);

        let server_task = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut reader = BufReader::new(read_half);
            let args = read_command(&mut reader).await.unwrap();
            send_log(&mut write_half, LogLevel::Info, &args.join(" "))
                .await
                .unwrap();
            send_exit_code(&mut write_half, CompileResult::Ok.code())
                .await
                .unwrap();
        });

        let mut lines = Vec::new();
        let code = exchange(
            &mut client,
            &["-verbose", "Main.java"],
            &mut |level: LogLevel, content: &str| lines.push(format!("{}:{}", level, content)),
        )
        .await
        .unwrap();
        server_task.await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(lines, vec!["INFO:-verbose Main.java"]);
    }
}

//! Newline-delimited request and response framing.
//!
//! ```text
//! client -> server:  <N>\n <arg 1>\n ... <arg N>\n
//! server -> client:  <LEVEL>:<text>\n ... RC:<code>\n
//! ```

use super::line::{LineKind, LogLevel, ProtocolLine, ERROR_EXIT_CODE, RC_TAG};
use super::sink::LogSink;
use crate::config::ProtocolConfig;
use crate::{HearthError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Send a request: the argument count, then one argument per line.
///
/// Arguments must not contain newlines; this is not checked.
pub async fn send_command<W, S>(writer: &mut W, args: &[S]) -> Result<()>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let mut buf = format!("{}\n", args.len());
    for arg in args {
        buf.push_str(arg.as_ref());
        buf.push('\n');
    }
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a request sent by [`send_command`].
pub async fn read_command<R>(reader: &mut R) -> Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let header = read_line(reader)
        .await?
        .ok_or_else(|| HearthError::framing("stream ended before the argument count"))?;
    let count: usize = header
        .trim()
        .parse()
        .map_err(|_| HearthError::framing(format!("invalid argument count: {:?}", header)))?;
    if count > ProtocolConfig::MAX_ARGS {
        return Err(HearthError::framing(format!(
            "argument count {} exceeds maximum {}",
            count,
            ProtocolConfig::MAX_ARGS
        )));
    }

    let mut args = Vec::with_capacity(count);
    for received in 0..count {
        let arg = read_line(reader).await?.ok_or_else(|| {
            HearthError::framing(format!(
                "expected {} arguments, stream ended after {}",
                count, received
            ))
        })?;
        args.push(arg);
    }
    Ok(args)
}

/// Send a log message, one tagged line per physical line.
pub async fn send_log<W>(writer: &mut W, level: LogLevel, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let message = message.strip_suffix('\n').unwrap_or(message);
    let mut buf = String::with_capacity(message.len() + 8);
    for line in message.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        buf.push_str(level.as_str());
        buf.push(':');
        buf.push_str(line);
        buf.push('\n');
    }
    writer.write_all(buf.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Send the terminal `RC:<code>` line.
pub async fn send_exit_code<W>(writer: &mut W, code: i32) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{}:{}\n", RC_TAG, code).as_bytes())
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Read a response, forwarding log lines to `sink`, and return the exit code.
///
/// If the stream ends (or the peer drops the connection) before an `RC:`
/// line, returns [`ERROR_EXIT_CODE`]. A line without a `:` is a hard error.
pub async fn read_response<R, S>(reader: &mut R, sink: &mut S) -> Result<i32>
where
    R: AsyncBufRead + Unpin,
    S: LogSink + ?Sized,
{
    loop {
        let line = match read_line(reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(HearthError::Io {
                source: Some(e), ..
            }) if is_disconnect(&e) => {
                debug!(error = %e, "Connection dropped while reading response");
                break;
            }
            Err(e) => return Err(e),
        };

        let parsed = ProtocolLine::parse(&line)?;
        match parsed.kind() {
            LineKind::Log(level) => sink.log(level, parsed.content),
            LineKind::ExitCode => return parsed.exit_code(),
            LineKind::Unknown => {
                debug!(tag = parsed.tag, "Ignoring response line with unknown tag");
            }
        }
    }

    debug!("Response ended without an exit code");
    Ok(ERROR_EXIT_CODE)
}

/// Read one line without its terminator.
///
/// Returns `None` at end of stream. Accepts `\r\n` endings.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = ProtocolConfig::MAX_LINE_LENGTH as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > ProtocolConfig::MAX_LINE_LENGTH {
        return Err(HearthError::framing(format!(
            "line exceeds maximum length {}",
            ProtocolConfig::MAX_LINE_LENGTH
        )));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| HearthError::framing("invalid UTF-8 in protocol line"))
}

fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discard(_: LogLevel, _: &str) {}

    #[tokio::test]
    async fn test_command_roundtrip_with_empty_argument() {
        let mut buf = Vec::new();
        send_command(&mut buf, &["a", "bc", ""]).await.unwrap();
        assert_eq!(buf, b"3\na\nbc\n\n");

        let mut reader = buf.as_slice();
        let args = read_command(&mut reader).await.unwrap();
        assert_eq!(args, vec!["a", "bc", ""]);
    }

    #[tokio::test]
    async fn test_command_roundtrip_over_duplex() {
        let (mut client, server) = tokio::io::duplex(64);
        let args = vec!["-d".to_string(), "out dir".to_string(), "A.java".to_string()];

        let writer = tokio::spawn(async move {
            send_command(&mut client, &args).await.unwrap();
        });

        let mut reader = tokio::io::BufReader::new(server);
        let received = read_command(&mut reader).await.unwrap();
        writer.await.unwrap();

        assert_eq!(received, vec!["-d", "out dir", "A.java"]);
    }

    #[tokio::test]
    async fn test_read_command_empty() {
        let mut reader: &[u8] = b"0\n";
        assert!(read_command(&mut reader).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_command_too_few_lines_fails() {
        let mut reader: &[u8] = b"3\na\nb\n";
        let result = read_command(&mut reader).await;
        assert!(matches!(result, Err(HearthError::Framing { .. })));
    }

    #[tokio::test]
    async fn test_read_command_bad_count_fails() {
        let mut reader: &[u8] = b"three\na\n";
        assert!(matches!(
            read_command(&mut reader).await,
            Err(HearthError::Framing { .. })
        ));

        let mut empty: &[u8] = b"";
        assert!(matches!(
            read_command(&mut empty).await,
            Err(HearthError::Framing { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_command_rejects_huge_count() {
        let header = format!("{}\n", ProtocolConfig::MAX_ARGS + 1);
        let mut reader = header.as_bytes();
        assert!(matches!(
            read_command(&mut reader).await,
            Err(HearthError::Framing { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_command_accepts_crlf() {
        let mut reader: &[u8] = b"2\r\nfoo\r\nbar\r\n";
        let args = read_command(&mut reader).await.unwrap();
        assert_eq!(args, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn test_response_forwards_logs_then_returns_code() {
        let mut reader: &[u8] = b"INFO:hello\nWARN:careful\nRC:3\nINFO:after\n";
        let mut seen = Vec::new();
        let code = read_response(&mut reader, &mut |level: LogLevel, content: &str| {
            seen.push((level, content.to_string()))
        })
        .await
        .unwrap();

        assert_eq!(code, 3);
        assert_eq!(
            seen,
            vec![
                (LogLevel::Info, "hello".to_string()),
                (LogLevel::Warn, "careful".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_response_without_rc_returns_sentinel() {
        let mut reader: &[u8] = b"INFO:hello\n";
        let mut count = 0;
        let code = read_response(&mut reader, &mut |_: LogLevel, _: &str| count += 1)
            .await
            .unwrap();

        assert_eq!(code, ERROR_EXIT_CODE);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_response_malformed_line_fails() {
        let mut reader: &[u8] = b"INFO:ok\ngarbage-no-colon\nRC:0\n";
        let mut sink = discard;
        let result = read_response(&mut reader, &mut sink).await;
        assert!(matches!(result, Err(HearthError::Framing { .. })));
    }

    #[tokio::test]
    async fn test_response_unknown_tag_is_skipped() {
        let mut reader: &[u8] = b"NOTICE:odd\nRC:0\n";
        let mut count = 0;
        let code = read_response(&mut reader, &mut |_: LogLevel, _: &str| count += 1)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_response_bad_exit_code_fails() {
        let mut reader: &[u8] = b"RC:ok\n";
        let mut sink = discard;
        assert!(matches!(
            read_response(&mut reader, &mut sink).await,
            Err(HearthError::Framing { .. })
        ));
    }

    #[tokio::test]
    async fn test_send_log_splits_multiline_messages() {
        let mut buf = Vec::new();
        send_log(&mut buf, LogLevel::Error, "first\nsecond: detail\r\nthird\n")
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "ERROR:first\nERROR:second: detail\nERROR:third\n"
        );
    }

    #[tokio::test]
    async fn test_send_log_empty_message_sends_one_line() {
        let mut buf = Vec::new();
        send_log(&mut buf, LogLevel::Info, "").await.unwrap();
        assert_eq!(buf, b"INFO:\n");
    }

    #[tokio::test]
    async fn test_full_response_roundtrip() {
        let mut buf = Vec::new();
        send_log(&mut buf, LogLevel::Info, "Compiling 2 files\nDone")
            .await
            .unwrap();
        send_exit_code(&mut buf, 2).await.unwrap();

        let mut reader = buf.as_slice();
        let mut seen = Vec::new();
        let code = read_response(&mut reader, &mut |_: LogLevel, content: &str| {
            seen.push(content.to_string())
        })
        .await
        .unwrap();

        assert_eq!(code, 2);
        assert_eq!(seen, vec!["Compiling 2 files", "Done"]);
    }

    #[tokio::test]
    async fn test_oversized_line_fails() {
        let data = vec![b'x'; ProtocolConfig::MAX_LINE_LENGTH + 10];
        let mut reader = data.as_slice();
        assert!(matches!(
            read_line(&mut reader).await,
            Err(HearthError::Framing { .. })
        ));
    }

    #[tokio::test]
    async fn test_response_after_peer_drop_returns_sentinel() {
        let (client, server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            let mut server = server;
            send_log(&mut server, LogLevel::Info, "starting").await.unwrap();
            // Server dies before the RC line.
        });

        let mut reader = tokio::io::BufReader::new(client);
        let mut sink = discard;
        writer.await.unwrap();
        let code = read_response(&mut reader, &mut sink).await.unwrap();
        assert_eq!(code, ERROR_EXIT_CODE);
    }
}

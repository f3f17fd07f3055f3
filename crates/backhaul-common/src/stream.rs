use std::future::poll_fn;

use bytes::Bytes;
use h2::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TunnelError;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Writes a whole buffer into an HTTP/2 send stream, waiting for flow-control
/// capacity instead of buffering unboundedly.
pub async fn send_all(stream: &mut SendStream<Bytes>, mut data: Bytes) -> Result<(), h2::Error> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(e),
            // Stream reset by the peer before capacity was assigned.
            None => return Err(h2::Error::from(h2::Reason::CANCEL)),
        };
        let n = granted.min(data.len());
        stream.send_data(data.split_to(n), false)?;
    }
    Ok(())
}

/// Copies a reader into an HTTP/2 send stream until EOF, then half-closes the
/// stream. Returns the number of bytes forwarded.
pub async fn copy_reader_to_send<R>(
    reader: &mut R,
    stream: &mut SendStream<Bytes>,
) -> Result<u64, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            stream.send_data(Bytes::new(), true)?;
            return Ok(copied);
        }
        send_all(stream, Bytes::copy_from_slice(&buf[..n])).await?;
        copied += n as u64;
    }
}

/// Copies an HTTP/2 receive stream into a writer until the peer half-closes,
/// releasing flow-control capacity chunk by chunk. Returns the number of
/// bytes forwarded.
pub async fn copy_recv_to_writer<W>(
    stream: &mut RecvStream,
    writer: &mut W,
) -> Result<u64, TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    while let Some(chunk) = stream.data().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        copied += chunk.len() as u64;
        stream.flow_control().release_capacity(chunk.len())?;
    }
    writer.flush().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    /// Client and server h2 endpoints joined by an in-memory duplex pipe.
    /// The returned responder must stay alive or the stream gets reset.
    async fn h2_pair() -> (
        SendStream<Bytes>,
        RecvStream,
        h2::server::SendResponse<Bytes>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let mut conn = h2::server::handshake(server_io).await.unwrap();
            let (req, respond) = conn.accept().await.unwrap().unwrap();
            tokio::spawn(async move {
                // Keep the connection driven while the test reads the body.
                let _ = poll_fn(|cx| conn.poll_closed(cx)).await;
            });
            (req.into_body(), respond)
        });

        let (client, conn) = h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });
        let mut client = client.ready().await.unwrap();
        let request = Request::put("https://test.invalid/").body(()).unwrap();
        let (_resp, send) = client.send_request(request, false).unwrap();

        let (recv, respond) = server.await.unwrap();
        (send, recv, respond)
    }

    #[tokio::test]
    async fn copies_reader_into_stream_and_back_out() {
        let (mut send, mut recv, _respond) = h2_pair().await;

        let payload = vec![7u8; 100_000];
        let mut reader = std::io::Cursor::new(payload.clone());

        let writer = tokio::spawn(async move {
            let mut out = Vec::new();
            copy_recv_to_writer(&mut recv, &mut out).await.unwrap();
            out
        });

        let sent = copy_reader_to_send(&mut reader, &mut send).await.unwrap();
        assert_eq!(sent, payload.len() as u64);
        assert_eq!(writer.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn send_all_handles_data_larger_than_window() {
        let (mut send, mut recv, _respond) = h2_pair().await;

        // Larger than the default 64 KiB stream window, forcing several
        // capacity grants.
        let payload = Bytes::from(vec![0x5au8; 256 * 1024]);
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let mut out = Vec::new();
            copy_recv_to_writer(&mut recv, &mut out).await.unwrap();
            out
        });

        send_all(&mut send, payload).await.unwrap();
        send.send_data(Bytes::new(), true).unwrap();
        assert_eq!(writer.await.unwrap(), expected);
    }
}

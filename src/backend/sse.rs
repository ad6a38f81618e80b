use futures_util::{stream::BoxStream, Stream, StreamExt};

use crate::backend::{transport_error, BackendError};

/// Splits an upstream body into trimmed, non-empty lines. Works for both
/// `text/event-stream` and newline-delimited JSON bodies.
pub fn lines(response: reqwest::Response) -> BoxStream<'static, Result<String, BackendError>> {
    split_lines(
        response
            .bytes_stream()
            .map(|next| next.map_err(transport_error)),
    )
}

pub(crate) fn split_lines<S, B>(
    mut upstream: S,
) -> BoxStream<'static, Result<String, BackendError>>
where
    S: Stream<Item = Result<B, BackendError>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(next) = upstream.next().await {
            let bytes = match next {
                Ok(bytes) => bytes,
                Err(error) => {
                    yield Err(error);
                    return;
                }
            };
            buffer.extend_from_slice(bytes.as_ref());

            while let Some(index) = buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=index).collect();
                match decode_line(&line) {
                    Ok(Some(text)) => yield Ok(text),
                    Ok(None) => {}
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                }
            }
        }

        match decode_line(&buffer) {
            Ok(Some(text)) => yield Ok(text),
            Ok(None) => {}
            Err(error) => yield Err(error),
        }
    };

    stream.boxed()
}

fn decode_line(line: &[u8]) -> Result<Option<String>, BackendError> {
    let text = std::str::from_utf8(line)
        .map_err(|error| BackendError::InvalidResponse(error.to_string()))?
        .trim();
    Ok((!text.is_empty()).then(|| text.to_owned()))
}

/// Payload of an SSE `data:` line, or `None` for comments, event names and ids.
pub fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    async fn collect(chunks: Vec<&'static [u8]>) -> Vec<Result<String, BackendError>> {
        split_lines(stream::iter(
            chunks.into_iter().map(Ok::<_, BackendError>),
        ))
        .collect()
        .await
    }

    #[tokio::test]
    async fn lines_are_reassembled_across_chunks() {
        let lines = collect(vec![
            &b"data: {\"a\""[..],
            &b":1}\n\n: ping\r\n"[..],
            &b"data: [DONE]"[..],
        ])
        .await;
        let lines = lines
            .into_iter()
            .map(|line| line.expect("line should decode"))
            .collect::<Vec<_>>();
        assert_eq!(lines, vec!["data: {\"a\":1}", ": ping", "data: [DONE]"]);
    }

    #[tokio::test]
    async fn invalid_utf8_in_trailing_line_is_reported() {
        let lines = collect(vec![&b"data: ok\n"[..], &b"data: \xff\xfe"[..]]).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].as_deref().expect("first line"), "data: ok");
        assert!(matches!(lines[1], Err(BackendError::InvalidResponse(_))));
    }

    #[test]
    fn data_payload_ignores_non_data_fields() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("event: message_start"), None);
        assert_eq!(data_payload(": keep-alive"), None);
    }
}

//! The pipeline driver.
//!
//! Consumes a stream of file names, resolves each document in its own
//! task, and emits rewritten documents in their input order, each
//! followed by the `\n---\n` delimiter. Emission always consumes the
//! head of an ordered queue of result slots, so a fast document never
//! overtakes a slow predecessor. Any resolution failure aborts the
//! pipeline with the file name attached.

use std::collections::VecDeque;
use std::sync::Arc;

use kolite_build::{Builder, Recorder};
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_publish::Publisher;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

/// Written after each document, so a streaming consumer can treat the
/// delimiter as an end-of-document marker.
const DOCUMENT_DELIMITER: &[u8] = b"\n---\n";

/// Resolve one file (or stdin for `-`) into its rewritten bytes.
pub async fn resolve_file(
    file: &str,
    builder: &dyn Builder,
    publisher: &dyn Publisher,
    token: &CancelToken,
    strict: bool,
) -> Result<Vec<u8>> {
    let bytes = if file == "-" {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        buf
    } else {
        tokio::fs::read(file).await?
    };

    kolite_resolve::image_references(&bytes, strict, token, builder, publisher).await
}

enum Step {
    Input(Option<String>),
    Head(std::result::Result<Result<Vec<u8>>, oneshot::error::RecvError>),
}

/// Stream files through resolution and write ordered output.
pub async fn resolve_files_to_writer<W>(
    builder: Arc<dyn Builder>,
    publisher: Arc<dyn Publisher>,
    token: &CancelToken,
    mut files: mpsc::UnboundedReceiver<String>,
    strict: bool,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut slots: VecDeque<oneshot::Receiver<Result<Vec<u8>>>> = VecDeque::new();
    let mut input_open = true;

    loop {
        if !input_open && slots.is_empty() {
            break;
        }

        // Select on the next input and/or the head slot, depending on
        // which are live. The head slot alone decides emission order.
        let step = match (input_open, slots.front_mut()) {
            (true, Some(head)) => tokio::select! {
                name = files.recv() => Step::Input(name),
                result = head => Step::Head(result),
            },
            (true, None) => Step::Input(files.recv().await),
            (false, Some(head)) => Step::Head(head.await),
            (false, None) => break,
        };

        match step {
            Step::Input(Some(file)) => {
                let (tx, rx) = oneshot::channel();
                slots.push_back(rx);

                let builder = builder.clone();
                let publisher = publisher.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    // Record the builds this file requests, associating
                    // the document with its references.
                    let recorder = Recorder::new(builder);
                    let result =
                        resolve_file(&file, &recorder, publisher.as_ref(), &token, strict)
                            .await
                            .map_err(|err| {
                                KoError::Resolve(format!(
                                    "error processing import paths in {:?}: {}",
                                    file, err
                                ))
                            });
                    tracing::debug!(
                        file = %file,
                        references = ?recorder.references(),
                        "resolved"
                    );
                    let _ = tx.send(result);
                });
            }
            Step::Input(None) => {
                input_open = false;
            }
            Step::Head(result) => {
                slots.pop_front();
                let bytes = result
                    .map_err(|_| KoError::Resolve("resolution task dropped".to_string()))??;
                // Delimiter last, so streamed consumers know the
                // resource is complete and may be applied.
                out.write_all(&bytes).await?;
                out.write_all(DOCUMENT_DELIMITER).await?;
            }
        }
    }

    out.flush().await?;
    Ok(())
}

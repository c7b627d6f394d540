//! End-to-end pipeline tests with mock builders and publishers.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kolite_build::{Builder, Caching};
use kolite_cli::driver::resolve_files_to_writer;
use kolite_core::cancel::CancelToken;
use kolite_core::error::{KoError, Result};
use kolite_core::name::ImageName;
use kolite_core::Platform;
use kolite_oci::{BuildResult, Image};
use kolite_publish::Publisher;
use tempfile::TempDir;
use tokio::sync::mpsc;

struct MockBuilder {
    builds: AtomicUsize,
    slow_delay: Duration,
}

impl MockBuilder {
    fn new() -> Self {
        MockBuilder {
            builds: AtomicUsize::new(0),
            slow_delay: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl Builder for MockBuilder {
    async fn is_supported_reference(&self, reference: &str) -> Result<()> {
        if reference.starts_with("ko://") {
            Ok(())
        } else {
            Err(KoError::Reference(format!("not ko://: {:?}", reference)))
        }
    }

    async fn build(&self, _token: &CancelToken, reference: &str) -> Result<BuildResult> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if reference.contains("slow") {
            tokio::time::sleep(self.slow_delay).await;
        }
        Ok(BuildResult::Image(Image::scratch(&Platform::new(
            "linux", "amd64",
        ))?))
    }
}

struct MockPublisher;

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(
        &self,
        _token: &CancelToken,
        result: &BuildResult,
        reference: &str,
    ) -> Result<ImageName> {
        let digest = result.digest()?;
        let base = kolite_core::Reference::parse(reference)
            .app_filename()
            .to_string();
        Ok(
            ImageName::new_tag(&format!("registry.example.com/{}", base), "latest")?
                .with_digest(&digest),
        )
    }
}

fn file_channel(files: &[String]) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    for file in files {
        tx.send(file.clone()).unwrap();
    }
    rx
}

async fn run_pipeline(
    builder: Arc<dyn Builder>,
    files: &[String],
    strict: bool,
) -> Result<String> {
    let mut out = Cursor::new(Vec::new());
    let token = CancelToken::new();
    resolve_files_to_writer(
        builder,
        Arc::new(MockPublisher),
        &token,
        file_channel(files),
        strict,
        &mut out,
    )
    .await?;
    Ok(String::from_utf8(out.into_inner()).expect("output is utf-8"))
}

fn write_manifest(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_output_order_matches_input_under_staggered_latency() {
    let tmp = TempDir::new().unwrap();
    let slow = write_manifest(&tmp, "a.yaml", "doc: first\nimage: ko://example.com/cmd/slow\n");
    let fast = write_manifest(&tmp, "b.yaml", "doc: second\nimage: ko://example.com/cmd/app\n");

    let out = run_pipeline(Arc::new(MockBuilder::new()), &[slow, fast], true)
        .await
        .unwrap();

    let first = out.find("doc: first").unwrap();
    let second = out.find("doc: second").unwrap();
    assert!(
        first < second,
        "slow first document must still precede the fast one:\n{}",
        out
    );
}

#[tokio::test]
async fn test_each_document_gets_trailing_delimiter() {
    let tmp = TempDir::new().unwrap();
    let mut files = Vec::new();
    for i in 0..4 {
        files.push(write_manifest(
            &tmp,
            &format!("{}.yaml", i),
            &format!("index: {}\nimage: ko://example.com/cmd/app\n", i),
        ));
    }

    let out = run_pipeline(Arc::new(MockBuilder::new()), &files, true)
        .await
        .unwrap();

    assert_eq!(out.matches("\n---\n").count(), 4);
    assert!(out.ends_with("\n---\n"));
    // Same count, same order.
    let positions: Vec<usize> = (0..4)
        .map(|i| out.find(&format!("index: {}", i)).unwrap())
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);
}

#[tokio::test]
async fn test_duplicate_references_build_once_across_documents() {
    let tmp = TempDir::new().unwrap();
    let a = write_manifest(&tmp, "a.yaml", "image: ko://example.com/cmd/slow\n");
    let b = write_manifest(&tmp, "b.yaml", "image: ko://example.com/cmd/slow\n");

    let inner = Arc::new(MockBuilder::new());
    let caching: Arc<dyn Builder> = Arc::new(Caching::new(inner.clone()));

    let start = std::time::Instant::now();
    let out = run_pipeline(caching, &[a, b], true).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(inner.builds.load(Ordering::SeqCst), 1);
    // Both documents resolve to the identical fully-qualified digest.
    let resolved: Vec<&str> = out
        .lines()
        .filter(|l| l.contains("registry.example.com/"))
        .collect();
    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[0], resolved[1]);
    // Roughly one build's worth of wall time, not two.
    assert!(
        elapsed < Duration::from_millis(380),
        "expected one shared build, took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_strict_failure_names_file_and_reference() {
    let tmp = TempDir::new().unwrap();
    let bad = write_manifest(&tmp, "bad.yaml", "image: mystery://whatever\n");

    let err = run_pipeline(Arc::new(MockBuilder::new()), &[bad.clone()], true)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("bad.yaml"), "missing path: {}", message);
    assert!(
        message.contains("mystery://whatever"),
        "missing offending string: {}",
        message
    );
}

#[tokio::test]
async fn test_missing_file_aborts_pipeline() {
    let err = run_pipeline(
        Arc::new(MockBuilder::new()),
        &["does-not-exist.yaml".to_string()],
        true,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("does-not-exist.yaml"));
}

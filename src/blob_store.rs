use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{info, warn};

use crate::{artifact_store::delete_file_if_exists, progress::ProgressSink};

const CHUNK_SIZE: usize = 256 * 1024;
const MAX_TITLE_CHARS: usize = 80;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        local: &Path,
        key: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject>;

    fn sign_retrieval_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("link expired")]
    Expired,
    #[error("invalid link signature")]
    InvalidSignature,
    #[error("invalid object key")]
    InvalidKey,
    #[error("link signing key rejected")]
    Key,
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, key: &str, expires: i64) -> Result<HmacSha256, LinkError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| LinkError::Key)?;
        mac.update(key.as_bytes());
        mac.update(b":");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, key: &str, expires: i64) -> Result<String, LinkError> {
        Ok(hex::encode(self.mac(key, expires)?.finalize().into_bytes()))
    }

    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: i64) -> Result<(), LinkError> {
        if !validate_key(key) {
            return Err(LinkError::InvalidKey);
        }
        if expires < now {
            return Err(LinkError::Expired);
        }
        let signature = hex::decode(signature).map_err(|_| LinkError::InvalidSignature)?;
        self.mac(key, expires)?
            .verify_slice(&signature)
            .map_err(|_| LinkError::InvalidSignature)
    }
}

pub fn validate_key(key: &str) -> bool {
    !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        })
}

pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len().min(MAX_TITLE_CHARS));
    for c in title.chars() {
        if out.len() >= MAX_TITLE_CHARS {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
            out.push(c);
        } else if (c.is_whitespace() || c == '_') && !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "video".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn blob_key(task_id: &str, title: &str, extension: &str) -> String {
    let extension: String = extension
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    let extension = if extension.is_empty() { "mp4".to_string() } else { extension };
    format!("{task_id}/{}.{extension}", sanitize_title(title))
}

pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
    signer: UrlSigner,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>, signer: UrlSigner) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
            signer,
        }
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed creating blob root {}", self.root.display()))
    }

    pub fn object_path(&self, key: &str) -> Result<PathBuf, LinkError> {
        if !validate_key(key) {
            return Err(LinkError::InvalidKey);
        }
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    pub fn resolve_signed(&self, key: &str, expires: i64, signature: &str) -> Result<PathBuf, LinkError> {
        self.signer
            .verify(key, expires, signature, Utc::now().timestamp())?;
        self.object_path(key)
    }
}

async fn copy_to_partial(
    input: &mut fs::File,
    partial: &Path,
    dest: &Path,
    total: u64,
    progress: &dyn ProgressSink,
) -> Result<u64> {
    let mut output = fs::File::create(partial)
        .await
        .with_context(|| format!("Failed creating {}", partial.display()))?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    progress.report(0, total).await;
    loop {
        let read = input.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        output.write_all(&buffer[..read]).await?;
        sent += read as u64;
        progress.report(sent, total).await;
    }
    output.flush().await?;
    output.sync_all().await?;
    drop(output);

    fs::rename(partial, dest)
        .await
        .with_context(|| format!("Failed moving blob into {}", dest.display()))?;
    Ok(sent)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(
        &self,
        local: &Path,
        key: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject> {
        let dest = self
            .object_path(key)
            .with_context(|| format!("Refusing to store blob under key {key:?}"))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed creating {}", parent.display()))?;
        }

        let mut input = fs::File::open(local)
            .await
            .with_context(|| format!("Failed opening {}", local.display()))?;
        let total = input.metadata().await?.len();

        let partial = dest.with_extension("partial");
        let sent = match copy_to_partial(&mut input, &partial, &dest, total, progress).await {
            Ok(sent) => sent,
            Err(err) => {
                if let Err(cleanup) = delete_file_if_exists(&partial).await {
                    warn!(key, "Failed removing partial blob: {cleanup:#}");
                }
                return Err(err);
            }
        };

        info!(key, size_bytes = sent, "Stored blob");
        Ok(StoredObject {
            key: key.to_string(),
            size_bytes: sent,
        })
    }

    fn sign_retrieval_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if !validate_key(key) {
            anyhow::bail!("Cannot sign link for invalid key {key:?}");
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.signer.sign(key, expires)?;
        Ok(format!(
            "{}/v1/files/{}?expires={}&signature={}",
            self.public_base_url.trim_end_matches('/'),
            key,
            expires,
            signature
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ticks: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn report(&self, done: u64, total: u64) {
            self.ticks.lock().unwrap().push((done, total));
        }
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        let query = url.split_once('?').unwrap().1;
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix(&format!("{name}=")))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_copies_in_chunks_and_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("merged.mp4");
        let payload = vec![7u8; CHUNK_SIZE * 2 + 10];
        std::fs::write(&local, &payload).unwrap();

        let store = LocalBlobStore::new(dir.path().join("blobs"), "http://h", UrlSigner::new("s"));
        let recorder = Recorder::default();
        let stored = store.upload(&local, "t1/clip.mp4", &recorder).await.unwrap();

        assert_eq!(stored.size_bytes, payload.len() as u64);
        let dest = store.object_path("t1/clip.mp4").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), payload);
        assert!(!dest.with_extension("partial").exists());

        let ticks = recorder.ticks.lock().unwrap();
        assert_eq!(ticks.first(), Some(&(0, payload.len() as u64)));
        assert_eq!(ticks.last(), Some(&(payload.len() as u64, payload.len() as u64)));
        assert!(ticks.windows(2).all(|pair| pair[0].0 <= pair[1].0));
    }

    #[tokio::test]
    async fn upload_of_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path(), "http://h", UrlSigner::new("s"));
        let result = store
            .upload(&dir.path().join("nope"), "t/x.mp4", &Recorder::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_copy_leaves_no_partial_behind() {
        let dir = tempfile::tempdir().unwrap();
        // Opening a directory succeeds but reading it fails.
        let unreadable = dir.path().join("not-a-file");
        std::fs::create_dir(&unreadable).unwrap();

        let store = LocalBlobStore::new(dir.path().join("blobs"), "http://h", UrlSigner::new("s"));
        let result = store
            .upload(&unreadable, "t1/clip.mp4", &Recorder::default())
            .await;

        assert!(result.is_err());
        let dest = store.object_path("t1/clip.mp4").unwrap();
        assert!(!dest.exists());
        assert!(!dest.with_extension("partial").exists());
    }

    #[test]
    fn signed_links_verify_until_expiry() {
        let store = LocalBlobStore::new("/blobs", "http://files.local/", UrlSigner::new("secret"));
        let url = store
            .sign_retrieval_url("t1/clip.mp4", Duration::from_secs(60))
            .unwrap();
        assert!(url.starts_with("http://files.local/v1/files/t1/clip.mp4?expires="));

        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        assert_eq!(
            store.resolve_signed("t1/clip.mp4", expires, signature).unwrap(),
            PathBuf::from("/blobs/t1/clip.mp4")
        );

        let signer = UrlSigner::new("secret");
        assert_eq!(
            signer.verify("t1/clip.mp4", expires, signature, expires + 1),
            Err(LinkError::Expired)
        );
    }

    #[test]
    fn tampered_links_are_rejected() {
        let signer = UrlSigner::new("secret");
        let signature = signer.sign("t1/clip.mp4", 2_000).unwrap();
        assert_eq!(
            signer.verify("t1/other.mp4", 2_000, &signature, 1_000),
            Err(LinkError::InvalidSignature)
        );
        assert_eq!(
            signer.verify("t1/clip.mp4", 2_001, &signature, 1_000),
            Err(LinkError::InvalidSignature)
        );
        assert_eq!(
            signer.verify("t1/clip.mp4", 2_000, "zz", 1_000),
            Err(LinkError::InvalidSignature)
        );
        assert_eq!(
            UrlSigner::new("other").verify("t1/clip.mp4", 2_000, &signature, 1_000),
            Err(LinkError::InvalidSignature)
        );
        assert!(signer.verify("t1/clip.mp4", 2_000, &signature, 1_000).is_ok());
    }

    #[test]
    fn traversal_keys_are_rejected() {
        for key in ["", "../etc/passwd", "t1/../../x", "/abs", "t1//x", "t1/a b.mp4", "t1/."] {
            assert!(!validate_key(key), "{key}");
        }
        let store = LocalBlobStore::new("/blobs", "http://h", UrlSigner::new("s"));
        assert_eq!(store.object_path("../x"), Err(LinkError::InvalidKey));
        assert!(store
            .sign_retrieval_url("../x", Duration::from_secs(1))
            .is_err());
    }

    #[test]
    fn titles_become_safe_keys() {
        assert_eq!(sanitize_title("My Great Video!"), "My_Great_Video");
        assert_eq!(sanitize_title("  ../..  "), "video");
        assert_eq!(sanitize_title("Привет"), "video");
        assert_eq!(sanitize_title(&"a".repeat(200)).len(), MAX_TITLE_CHARS);

        let key = blob_key("task-1", "Rock & Roll (Live)", ".MP4");
        assert_eq!(key, "task-1/Rock_Roll_Live.mp4");
        assert!(validate_key(&key));
    }
}

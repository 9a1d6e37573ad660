//! Sealing of exported ledger snapshots.
//!
//! A secured snapshot carries `snapshot.seal.json` beside the store manifest.
//! The seal signature covers the snapshot id, the record counter, the ledger
//! height and every file digest, so an import cannot be fed a snapshot whose
//! counter was rewound. Encrypted files are bound to their snapshot id and file
//! name as associated data; the manifest keeps plaintext digests so the store
//! validates decrypted files unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use registry_kernel_core::{LedgerHeight, RecordId};
use registry_kernel_store_sqlite::{ExportManifest, MANIFEST_FILE, SNAPSHOT_FILES};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};
use ulid::Ulid;

pub const SEAL_FILE: &str = "snapshot.seal.json";

const ENCRYPTION_MAGIC: &[u8] = b"RKENC1";
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const ENCRYPTION_ALGORITHM: &str = "xchacha20poly1305";
const SIGNATURE_ALGORITHM: &str = "hmac-sha256";
const ATTESTATION_DOMAIN: &str = "registry-kernel-snapshot/v1";

type HmacSha256 = Hmac<Sha256>;

/// 32-byte key loaded from a file holding its hex encoding.
pub struct SnapshotKey([u8; 32]);

impl SnapshotKey {
    pub fn from_hex_file(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let bytes = hex::decode(body.trim())
            .with_context(|| format!("key file must contain hex bytes: {}", path.display()))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow!("key file {} must decode to exactly 32 bytes (got {})", path.display(), bytes.len())
        })?;
        Ok(Self(key))
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|err| anyhow!("failed to initialize snapshot signing key: {err}"))
    }

    fn encrypt_file(&self, snapshot_id: &str, file: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0_u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let aad = file_binding(snapshot_id, file);
        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: aad.as_bytes() })
            .map_err(|err| anyhow!("failed to encrypt snapshot file {file}: {err}"))?;

        let mut out = Vec::with_capacity(ENCRYPTION_MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(ENCRYPTION_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_file(&self, snapshot_id: &str, file: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        let Some(body) = sealed.strip_prefix(ENCRYPTION_MAGIC) else {
            bail!("snapshot file {file} is missing the RKENC1 header");
        };
        if body.len() < NONCE_LEN + TAG_LEN {
            bail!("snapshot file {file} is too short to be encrypted");
        }
        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        let aad = file_binding(snapshot_id, file);
        self.cipher()
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: aad.as_bytes() })
            .map_err(|_| anyhow!("failed to decrypt snapshot file {file} for snapshot {snapshot_id}"))
    }
}

fn file_binding(snapshot_id: &str, file: &str) -> String {
    format!("{snapshot_id}/{file}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealSignature {
    pub algorithm: String,
    pub mac: String,
}

/// Contents of `snapshot.seal.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSeal {
    pub snapshot_id: String,
    pub last_record_id: RecordId,
    pub ledger_height: LedgerHeight,
    pub sealed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SealSignature>,
}

impl SnapshotSeal {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

/// Canonical text the seal signature is computed over.
fn attestation(manifest: &ExportManifest, encryption: Option<&str>) -> String {
    let mut lines = vec![
        ATTESTATION_DOMAIN.to_string(),
        format!("snapshot_id={}", manifest.snapshot_id),
        format!("schema_version={}", manifest.schema_version),
        format!("last_record_id={}", manifest.last_record_id.0),
        format!("ledger_height={}", manifest.ledger_height.0),
        format!("encryption={}", encryption.unwrap_or("none")),
    ];
    for file in &manifest.files {
        lines.push(format!("file={} sha256={} records={}", file.path, file.sha256, file.records));
    }
    lines.join("\n")
}

fn sign(manifest: &ExportManifest, encryption: Option<&str>, key: &SnapshotKey) -> Result<SealSignature> {
    let mut mac = key.mac()?;
    mac.update(attestation(manifest, encryption).as_bytes());
    Ok(SealSignature {
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        mac: hex::encode(mac.finalize().into_bytes()),
    })
}

fn verify(manifest: &ExportManifest, seal: &SnapshotSeal, key: &SnapshotKey) -> Result<()> {
    let Some(signature) = seal.signature.as_ref() else {
        bail!("snapshot {} carries no seal signature", manifest.snapshot_id);
    };
    if signature.algorithm != SIGNATURE_ALGORITHM {
        bail!("unsupported seal signature algorithm `{}`", signature.algorithm);
    }
    if seal.snapshot_id != manifest.snapshot_id
        || seal.last_record_id != manifest.last_record_id
        || seal.ledger_height != manifest.ledger_height
    {
        bail!(
            "seal for snapshot {} (counter {}, height {}) does not match manifest {} (counter {}, height {})",
            seal.snapshot_id,
            seal.last_record_id.0,
            seal.ledger_height.0,
            manifest.snapshot_id,
            manifest.last_record_id.0,
            manifest.ledger_height.0
        );
    }
    let expected = hex::decode(&signature.mac).context("seal signature is not valid hex")?;
    let mut mac = key.mac()?;
    mac.update(attestation(manifest, seal.encryption.as_deref()).as_bytes());
    mac.verify_slice(&expected).map_err(|_| {
        anyhow!("seal signature verification failed for snapshot {}", manifest.snapshot_id)
    })
}

/// Encrypt and/or sign a freshly exported snapshot directory in place.
///
/// Returns `None` and removes any stale seal when neither key is given.
pub fn seal_snapshot(
    out_dir: &Path,
    manifest: &ExportManifest,
    signing_key: Option<&SnapshotKey>,
    encryption_key: Option<&SnapshotKey>,
) -> Result<Option<SnapshotSeal>> {
    let seal_path = out_dir.join(SEAL_FILE);
    if signing_key.is_none() && encryption_key.is_none() {
        if seal_path.exists() {
            fs::remove_file(&seal_path)
                .with_context(|| format!("failed to remove stale seal {}", seal_path.display()))?;
        }
        return Ok(None);
    }

    if let Some(key) = encryption_key {
        for file in &manifest.files {
            let path = out_dir.join(&file.path);
            let plaintext = fs::read(&path)
                .with_context(|| format!("failed to read export file {}", path.display()))?;
            let sealed = key.encrypt_file(&manifest.snapshot_id, &file.path, &plaintext)?;
            fs::write(&path, sealed)
                .with_context(|| format!("failed to write encrypted file {}", path.display()))?;
        }
    }

    let encryption = encryption_key.map(|_| ENCRYPTION_ALGORITHM.to_string());
    let signature =
        signing_key.map(|key| sign(manifest, encryption.as_deref(), key)).transpose()?;
    let seal = SnapshotSeal {
        snapshot_id: manifest.snapshot_id.clone(),
        last_record_id: manifest.last_record_id,
        ledger_height: manifest.ledger_height,
        sealed_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format seal timestamp")?,
        encryption,
        signature,
    };
    let body = serde_json::to_vec_pretty(&seal).context("failed to serialize snapshot seal")?;
    fs::write(&seal_path, body)
        .with_context(|| format!("failed to write snapshot seal {}", seal_path.display()))?;
    Ok(Some(seal))
}

/// Directory removed when dropped.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn create(root: &Path) -> Result<Self> {
        let path = root.join(format!("registrykernel-import-decrypted-{}", Ulid::new()));
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create decryption dir {}", path.display()))?;
        Ok(Self(path))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.0) {
            warn!(dir = %self.0.display(), error = %err, "failed to remove decryption dir");
        }
    }
}

/// Snapshot directory ready for the store's import. A decrypted copy lives in
/// a scratch directory that is removed when this value is dropped.
pub struct OpenedSnapshot {
    dir: PathBuf,
    scratch: Option<ScratchDir>,
}

impl OpenedSnapshot {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn decrypted(&self) -> bool {
        self.scratch.is_some()
    }
}

fn read_manifest(in_dir: &Path) -> Result<ExportManifest> {
    let path = in_dir.join(MANIFEST_FILE);
    let bytes =
        fs::read(&path).with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest: ExportManifest = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    for file in &manifest.files {
        if !SNAPSHOT_FILES.contains(&file.path.as_str()) {
            bail!(
                "manifest lists unexpected file `{}`; ledger snapshots carry only {}",
                file.path,
                SNAPSHOT_FILES.join(", ")
            );
        }
    }
    Ok(manifest)
}

fn read_seal(in_dir: &Path) -> Result<Option<SnapshotSeal>> {
    let path = in_dir.join(SEAL_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let body = fs::read_to_string(&path)
        .with_context(|| format!("failed to read snapshot seal {}", path.display()))?;
    let seal = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse snapshot seal {}", path.display()))?;
    Ok(Some(seal))
}

/// Check the seal of `in_dir` and decrypt it under `scratch_root` when needed.
pub fn open_snapshot(
    in_dir: &Path,
    verify_key: Option<&SnapshotKey>,
    decrypt_key: Option<&SnapshotKey>,
    allow_unsigned: bool,
    scratch_root: &Path,
) -> Result<OpenedSnapshot> {
    let manifest = read_manifest(in_dir)?;
    let seal = read_seal(in_dir)?;

    match seal.as_ref().filter(|seal| seal.is_signed()) {
        Some(seal) => {
            let key = verify_key.ok_or_else(|| {
                anyhow!(
                    "snapshot {} is signed; provide --verify-key-file to verify it",
                    manifest.snapshot_id
                )
            })?;
            verify(&manifest, seal, key)?;
        }
        None if allow_unsigned => {
            debug!(snapshot_id = %manifest.snapshot_id, "importing unsigned snapshot");
        }
        None => bail!(
            "snapshot {} is unsigned; rerun with --allow-unsigned for explicit override",
            manifest.snapshot_id
        ),
    }

    let Some(algorithm) = seal.and_then(|seal| seal.encryption) else {
        return Ok(OpenedSnapshot { dir: in_dir.to_path_buf(), scratch: None });
    };
    if algorithm != ENCRYPTION_ALGORITHM {
        bail!("unsupported snapshot encryption `{algorithm}`");
    }
    let key = decrypt_key.ok_or_else(|| {
        anyhow!(
            "snapshot {} is encrypted; provide --decrypt-key-file to import it",
            manifest.snapshot_id
        )
    })?;

    let scratch = ScratchDir::create(scratch_root)?;
    for file in &manifest.files {
        let source = in_dir.join(&file.path);
        let sealed = fs::read(&source)
            .with_context(|| format!("failed to read encrypted file {}", source.display()))?;
        let plaintext = key.decrypt_file(&manifest.snapshot_id, &file.path, &sealed)?;
        let target = scratch.0.join(&file.path);
        fs::write(&target, plaintext)
            .with_context(|| format!("failed to write decrypted file {}", target.display()))?;
    }
    let manifest_target = scratch.0.join(MANIFEST_FILE);
    fs::copy(in_dir.join(MANIFEST_FILE), &manifest_target)
        .with_context(|| format!("failed to copy manifest to {}", manifest_target.display()))?;

    debug!(
        snapshot_id = %manifest.snapshot_id,
        dir = %scratch.0.display(),
        files = manifest.files.len(),
        "decrypted snapshot for import"
    );
    Ok(OpenedSnapshot { dir: scratch.0.clone(), scratch: Some(scratch) })
}

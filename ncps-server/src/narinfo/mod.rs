//! NAR info.
//!
//! ## `.narinfo` format
//!
//! An example of [a valid
//! .narinfo](https://cache.nixos.org/p4pclmv1gyja5kzc26npqpia1qqxrf0l.narinfo)
//! signed by https://cache.nixos.org:
//!
//! ```text
//! StorePath: /nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3
//! URL: nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz
//! Compression: xz
//! FileHash: sha256:1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3
//! FileSize: 4029176
//! NarHash: sha256:1impfw8zdgisxkghq9a3q7cn7jb9zyzgxdydiamp8z2nlyyl0h5h
//! NarSize: 18735072
//! References: 0d71ygfwbmy1xjlbj1v027dfmy9cqavy-libffi-3.3 sbbifs2ykc05inws26203h0xwcadnf0l-glibc-2.32-46
//! Deriver: bidkcs01mww363s4s7akdhbl6ws66b0z-ruby-2.7.3.drv
//! Sig: cache.nixos.org-1:GrGV/Ls10TzoOaCnrcAqmPbKXFLLSBDeGNh5EQGKyuGA4K1wv1LcRVb6/sU+NAPK8lDiam8XcdJzUngmdhfTBQ==
//! ```
//!
//! Consult the following files for the Nix implementation:
//!
//! - `src/libstore/nar-info.cc`
//! - `src/libstore/path-info.hh`
//!
//! They provide valuable information on what are the required fields.
//!
//! Unlike upstream Nix, a narinfo's `Sig:` field can be repeated: a NarInfo
//! record keeps the *set* of signatures attached to it (upstream signatures
//! we chose to preserve, plus our own). The generic manifest serde
//! machinery only round-trips one occurrence of each key, so signatures are
//! handled outside of it in [`NarInfo::from_str`]/[`NarInfo::to_string`].
//!
//! ## Fingerprint
//!
//! The fingerprint format is described in `perl/lib/Nix/Manifest.pm` (`sub
//! fingerprintAuth`). Each fingerprint contains the full store path, the
//! NAR hash, the NAR size, as well as a list of references (full store
//! paths). The format is as follows:
//!
//! ```text
//! 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}
//! ```

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::string::ToString;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::error::{ServerError, ServerResult};
use crate::nix_manifest::{self, SpaceDelimitedList};
use ncps_core::hash::Hash;
use ncps_core::mime;
use ncps_core::signing::NixKeypair;

#[cfg(test)]
mod tests;

/// NAR information.
#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct NarInfo {
    /// The full store path being cached, including the store directory.
    ///
    /// Part of the fingerprint.
    ///
    /// Example: `/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3`.
    #[serde(rename = "StorePath")]
    pub store_path: PathBuf,

    /// The URL to fetch the object.
    ///
    /// This can either be relative to the base cache URL, or be a full,
    /// absolute URL pointing at the upstream cache the payload was fetched
    /// from.
    ///
    /// Example: `nar/1w1fff338fvdw53sqgamddn1b2xgds473pv6y13gizdbqjv4i5p3.nar.xz`
    #[serde(rename = "URL")]
    pub url: String,

    /// Compression in use.
    #[serde(rename = "Compression")]
    pub compression: Compression,

    /// The hash of the compressed file.
    ///
    /// We don't know the file hash if it's chunked.
    #[serde(rename = "FileHash")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<Hash>,

    /// The size of the compressed file.
    ///
    /// We may not know the file size if it's chunked.
    #[serde(rename = "FileSize")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<usize>,

    /// The hash of the NAR archive.
    ///
    /// Part of the fingerprint.
    #[serde(rename = "NarHash")]
    pub nar_hash: Hash,

    /// The size of the NAR archive.
    ///
    /// Part of the fingerprint.
    #[serde(rename = "NarSize")]
    pub nar_size: usize,

    /// Other store paths this object directly references.
    ///
    /// This only includes the base paths, not the store directory itself.
    ///
    /// Part of the fingerprint.
    ///
    /// Example element: `j5p0j1w27aqdzncpw73k95byvhh5prw2-glibc-2.33-47`
    #[serde(rename = "References")]
    #[serde_as(as = "SpaceDelimitedList")]
    pub references: Vec<String>,

    /// The system this derivation is built for.
    #[serde(rename = "System")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// The derivation that produced this object.
    #[serde(rename = "Deriver")]
    #[serde(default)]
    #[serde(deserialize_with = "deserialize_deriver")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deriver: Option<String>,

    /// The content address of the object.
    #[serde(rename = "CA")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,

    /// The set of signatures attached to this object, in canonical
    /// `keyName:base64Payload` form.
    ///
    /// Handled outside of the generic manifest (de)serializer: see the
    /// module docs.
    #[serde(skip)]
    pub signatures: Vec<String>,
}

/// NAR compression type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "xz")]
    Xz,
    #[serde(rename = "bzip2")]
    Bzip2,
    #[serde(rename = "br")]
    Brotli,
    #[serde(rename = "zstd")]
    Zstd,
}

impl NarInfo {
    /// Parses a narinfo from a string.
    ///
    /// `Sig:` lines are pulled out of the raw text before handing the rest
    /// to the generic manifest deserializer, since a narinfo may carry any
    /// number of them.
    pub fn from_str(manifest: &str) -> ServerResult<Self> {
        let mut signatures = Vec::new();
        let mut rest = String::with_capacity(manifest.len());

        for line in manifest.lines() {
            if let Some(sig) = line.trim_start().strip_prefix("Sig:") {
                signatures.push(sig.trim().to_string());
            } else {
                rest.push_str(line);
                rest.push('\n');
            }
        }

        let mut narinfo: Self = nix_manifest::from_str(&rest)?;
        narinfo.signatures = signatures;
        Ok(narinfo)
    }

    /// Returns the serialized representation of the narinfo.
    pub fn to_string(&self) -> ServerResult<String> {
        let mut out = nix_manifest::to_string(self)?;
        for sig in &self.signatures {
            out.push_str("Sig: ");
            out.push_str(sig);
            out.push('\n');
        }
        Ok(out)
    }

    /// Returns the signatures attached to this object.
    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// Returns the store directory of this object.
    pub fn store_dir(&self) -> &Path {
        self.store_path
            .parent()
            .unwrap_or_else(|| Path::new("/nix/store"))
    }

    /// Removes any signature whose key name matches `key_name`.
    ///
    /// Used before re-signing, so a stale signature under our own key
    /// doesn't linger alongside the fresh one.
    pub fn strip_signatures_by(&mut self, key_name: &str) {
        let prefix = format!("{key_name}:");
        self.signatures.retain(|s| !s.starts_with(&prefix));
    }

    /// Signs the narinfo and appends the signature to the signature set.
    pub fn sign(&mut self, keypair: &NixKeypair) {
        let signature = self.sign_readonly(keypair);
        self.signatures.push(signature);
    }

    /// Returns the fingerprint of the object.
    pub fn fingerprint(&self) -> Vec<u8> {
        let store_dir = self.store_dir();
        let mut fingerprint = b"1;".to_vec();

        // 1;{storePath};{narHash};{narSize};{commaDelimitedReferences}

        fingerprint.extend(self.store_path.as_os_str().as_bytes());
        fingerprint.extend(b";");

        fingerprint.extend(self.nar_hash.to_typed_base32().as_bytes());
        fingerprint.extend(b";");

        let mut buf = itoa::Buffer::new();
        let nar_size = buf.format(self.nar_size);
        fingerprint.extend(nar_size.as_bytes());
        fingerprint.extend(b";");

        let mut iter = self.references.iter().peekable();
        while let Some(reference) = iter.next() {
            fingerprint.extend(store_dir.as_os_str().as_bytes());
            fingerprint.extend(b"/");
            fingerprint.extend(reference.as_bytes());

            if iter.peek().is_some() {
                fingerprint.extend(b",");
            }
        }

        fingerprint
    }

    /// Signs the narinfo with a keypair, returning the signature.
    fn sign_readonly(&self, keypair: &NixKeypair) -> String {
        let fingerprint = self.fingerprint();
        keypair.sign(&fingerprint)
    }
}

impl IntoResponse for NarInfo {
    fn into_response(self) -> Response {
        match self.to_string() {
            Ok(body) => Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", mime::NARINFO)
                .body(body)
                .unwrap()
                .into_response(),
            Err(e) => e.into_response(),
        }
    }
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Xz => "xz",
            Self::Bzip2 => "bzip2",
            Self::Brotli => "br",
            Self::Zstd => "zstd",
        }
    }
}

impl FromStr for Compression {
    type Err = ServerError;

    fn from_str(s: &str) -> ServerResult<Self> {
        match s {
            "none" => Ok(Self::None),
            "xz" => Ok(Self::Xz),
            "bzip2" => Ok(Self::Bzip2),
            "br" => Ok(Self::Brotli),
            "zstd" => Ok(Self::Zstd),
            _ => Err(ServerError::InvalidCompressionType {
                name: s.to_string(),
            }),
        }
    }
}

impl ToString for Compression {
    fn to_string(&self) -> String {
        String::from(self.as_str())
    }
}

pub fn deserialize_deriver<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.as_str() {
        "unknown-deriver" => Ok(None),
        _ => Ok(Some(s)),
    }
}

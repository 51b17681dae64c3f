//! Content synthesis for file nodes.
//!
//! Everything here is a pure function of the stored credential and its
//! filename stem, so repeated materialization of an unchanged store yields
//! byte-identical output.  The archive uses stored (uncompressed) entries
//! with the fixed DOS epoch timestamp.

use std::io::{Cursor, Write};

use base64::prelude::{BASE64_STANDARD, Engine};
use keyshare_core::{CredentialEntry, CredentialId, InstalledCredential};
use serde::Serialize;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::VfsError;

/// Public description served as the detail file.
#[derive(Debug, Serialize)]
struct Detail<'a> {
    id: &'a CredentialId,
    friendly_name: &'a str,
    subject: &'a str,
    issuer: &'a str,
    not_before: &'a str,
    not_after: &'a str,
    has_private_key: bool,
    chain_len: usize,
    size: u64,
}

impl<'a> From<&'a CredentialEntry> for Detail<'a> {
    fn from(e: &'a CredentialEntry) -> Self {
        Self {
            id: &e.id,
            friendly_name: &e.friendly_name,
            subject: &e.subject,
            issuer: &e.issuer,
            not_before: &e.not_before,
            not_after: &e.not_after,
            has_private_key: e.has_private_key,
            chain_len: e.chain_len,
            size: e.size,
        }
    }
}

/// Pretty JSON descriptor for `entry`, newline terminated.
pub fn detail_bytes(entry: &CredentialEntry) -> Vec<u8> {
    // Serialising a struct of strings, bools and integers cannot fail.
    let mut out = serde_json::to_vec_pretty(&Detail::from(entry)).unwrap_or_default();
    out.push(b'\n');
    out
}

/// Exact length of [`detail_bytes`], used for placeholder sizes.
pub fn detail_len(entry: &CredentialEntry) -> u64 {
    detail_bytes(entry).len() as u64
}

/// PEM certificate chain, leaf first.
pub fn chain_pem(chain: &[Vec<u8>]) -> String {
    let mut out = String::new();
    for der in chain {
        let b64 = BASE64_STANDARD.encode(der);
        out.push_str("-----BEGIN CERTIFICATE-----\n");
        for line in b64.as_bytes().chunks(64) {
            // Base64 output is ASCII.
            out.push_str(std::str::from_utf8(line).unwrap_or_default());
            out.push('\n');
        }
        out.push_str("-----END CERTIFICATE-----\n");
    }
    out
}

/// ZIP archive holding `<stem>.p12` (when the credential has an export) and
/// `<stem>-chain.pem`.
pub fn bundle_bytes(credential: &InstalledCredential, stem: &str) -> Result<Vec<u8>, VfsError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o600);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    if let Some(export) = &credential.export {
        zip.start_file(format!("{stem}.p12"), options)?;
        write_entry(&mut zip, export)?;
    }
    zip.start_file(format!("{stem}-chain.pem"), options)?;
    write_entry(&mut zip, chain_pem(&credential.chain).as_bytes())?;
    Ok(zip.finish()?.into_inner())
}

fn write_entry(zip: &mut ZipWriter<Cursor<Vec<u8>>>, data: &[u8]) -> Result<(), VfsError> {
    zip.write_all(data)
        .map_err(|e| VfsError::Archive(e.to_string()))
}

//! PKCS#12 bundle parsing.
//!
//! Opening a bundle is pure: it takes the source bytes and a password and
//! either yields ready-to-install credentials or says why it could not.  It
//! never touches the store, so a rejected attempt has no side effects.
//!
//! Structure of a typical bundle:
//!
//! ```text
//! PFX
//! ├── MAC (HMAC over the auth safe, keyed from the password)
//! └── auth safe
//!     ├── encrypted bag: certificates (leaf, intermediates, root)
//!     └── shrouded key bag: PKCS#8 private key
//! ```
//!
//! Decryption and key pairing are done by `p12-keystore`, which handles
//! both the legacy PBE schemes (SHA-1 MAC, 3DES) and PBES2 with AES and an
//! HMAC-SHA256 MAC.  A private key is matched to the certificate carrying
//! the same `localKeyId`, and its chain is followed by issuer name among the
//! remaining certificates.  Certificates marked as trusted become
//! certificate-only credentials; other unkeyed certificates are chain
//! material and are not installed on their own.

use der::Decode as _;
use keyshare_core::{CredentialEntry, CredentialId, InstalledCredential, SecretBytes};
use p12_keystore::error::Error as P12Error;
use p12_keystore::{KeyStore, KeyStoreEntry, PrivateKeyChain};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Why a bundle could not be opened.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    #[error("incorrect password")]
    BadPassword,
    #[error("the file is not a valid PKCS#12 bundle: {0}")]
    Corrupt(String),
}

impl BundleError {
    pub fn kind(&self) -> keyshare_core::ErrorKind {
        match self {
            Self::BadPassword => keyshare_core::ErrorKind::BadPassword,
            Self::Corrupt(_) => keyshare_core::ErrorKind::CorruptBundle,
        }
    }

    /// Short text shown next to the password field on the next attempt.
    pub fn user_label(&self) -> String {
        match self {
            Self::BadPassword => "Incorrect password, try again".to_string(),
            Self::Corrupt(_) => "The file could not be read as a certificate bundle".to_string(),
        }
    }

    /// Map a keystore failure.  With a MAC only a MAC mismatch means a
    /// wrong password; without one, a bag that fails to decrypt or decode
    /// is the only sign of it.
    fn from_keystore(err: P12Error, has_mac: bool) -> Self {
        match err {
            P12Error::MacError(_) => Self::BadPassword,
            P12Error::Pkcs5Error(_) | P12Error::UnpadError | P12Error::DerError(_) if !has_mac => {
                Self::BadPassword
            }
            other => Self::Corrupt(other.to_string()),
        }
    }
}

/// Parsed view of one certificate.
struct Cert {
    subject: String,
    issuer: String,
    common_name: Option<String>,
    not_before: String,
    not_after: String,
}

impl Cert {
    fn parse(der: &[u8]) -> Result<Self, BundleError> {
        let (_, x509) = X509Certificate::from_der(der)
            .map_err(|e| BundleError::Corrupt(format!("certificate: {e}")))?;
        let subject = x509.subject();
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        Ok(Self {
            subject: subject.to_string(),
            issuer: x509.issuer().to_string(),
            common_name,
            not_before: x509.validity().not_before.to_string(),
            not_after: x509.validity().not_after.to_string(),
        })
    }
}

/// Open `der` with `password` and turn every keyed certificate, and every
/// trusted certificate, into an installable credential.
///
/// Credentials with a private key carry a freshly built PKCS#12 export
/// protected by the same password.  The export is generated once here and
/// stored, so later reads are stable.
pub fn open(der: &[u8], password: &str) -> Result<Vec<InstalledCredential>, BundleError> {
    let pfx = pkcs12::pfx::Pfx::from_der(der)
        .map_err(|e| BundleError::Corrupt(format!("PFX structure: {e}")))?;
    let has_mac = pfx.mac_data.is_some();

    let keystore =
        KeyStore::from_pkcs12(der, password).map_err(|e| BundleError::from_keystore(e, has_mac))?;

    let mut creds: Vec<InstalledCredential> = Vec::new();
    for (alias, entry) in keystore.entries() {
        let cred = match entry {
            KeyStoreEntry::PrivateKeyChain(chain) => keyed_credential(chain, password)?,
            KeyStoreEntry::Certificate(cert) => cert_only_credential(cert.as_der())?,
        };
        if creds.iter().any(|c| c.entry.id == cred.entry.id) {
            debug!(alias = %alias, "duplicate bundle entry skipped");
            continue;
        }
        creds.push(cred);
    }
    debug!(has_mac, credentials = creds.len(), "bundle opened");

    if creds.is_empty() {
        return Err(BundleError::Corrupt(
            "no private key with a matching certificate".to_string(),
        ));
    }
    Ok(creds)
}

fn friendly_name(cert: &Cert, id: &CredentialId) -> String {
    cert.common_name
        .clone()
        .filter(|cn| !cn.trim().is_empty())
        .or_else(|| (!cert.subject.is_empty()).then(|| cert.subject.clone()))
        .unwrap_or_else(|| format!("Certificate {}", id.short()))
}

fn keyed_credential(
    chain: &PrivateKeyChain,
    password: &str,
) -> Result<InstalledCredential, BundleError> {
    let leaf = chain
        .chain()
        .first()
        .ok_or_else(|| BundleError::Corrupt("private key without certificate".to_string()))?;
    let cert = Cert::parse(leaf.as_der())?;
    let id = CredentialId::from_leaf_der(leaf.as_der());
    let friendly_name = friendly_name(&cert, &id);

    // Re-wrap just this identity so a multi-identity bundle exports one
    // credential per file.
    let mut single = KeyStore::new();
    single.add_entry(&friendly_name, KeyStoreEntry::PrivateKeyChain(chain.clone()));
    let export = single
        .writer(password)
        .write()
        .map_err(|e| BundleError::Corrupt(format!("private key could not be re-wrapped: {e}")))?;

    let ders: Vec<Vec<u8>> = chain.chain().iter().map(|c| c.as_der().to_vec()).collect();
    Ok(InstalledCredential {
        entry: CredentialEntry {
            id,
            friendly_name,
            subject: cert.subject,
            issuer: cert.issuer,
            not_before: cert.not_before,
            not_after: cert.not_after,
            size: export.len() as u64,
            has_private_key: true,
            chain_len: ders.len(),
        },
        private_key: Some(SecretBytes::new(chain.key().to_vec())),
        chain: ders,
        export: Some(export),
    })
}

fn cert_only_credential(der: &[u8]) -> Result<InstalledCredential, BundleError> {
    let cert = Cert::parse(der)?;
    let id = CredentialId::from_leaf_der(der);
    let friendly_name = friendly_name(&cert, &id);
    Ok(InstalledCredential {
        entry: CredentialEntry {
            id,
            friendly_name,
            subject: cert.subject,
            issuer: cert.issuer,
            not_before: cert.not_before,
            not_after: cert.not_after,
            size: der.len() as u64,
            has_private_key: false,
            chain_len: 1,
        },
        private_key: None,
        chain: vec![der.to_vec()],
        export: None,
    })
}

#[cfg(test)]
mod tests {
    use p12_keystore::Certificate;

    use super::*;
    use crate::testutil::{TestPki, bundle_of, key_entry_of};

    const MODERN: &[u8] = include_bytes!("../testdata/modern.p12");
    const LEGACY: &[u8] = include_bytes!("../testdata/legacy.p12");
    const NO_MAC: &[u8] = include_bytes!("../testdata/nomac.p12");
    const BOB_THEN_ALICE: &[u8] = include_bytes!("../testdata/bob-then-alice.p12");

    #[test]
    fn one_key_two_certificates_yields_one_credential() {
        let pki = TestPki::new("Alice Example");
        let der = pki.bundle("correct");

        let creds = open(&der, "correct").unwrap();
        assert_eq!(creds.len(), 1);
        let c = &creds[0];
        assert_eq!(c.entry.friendly_name, "Alice Example");
        assert!(c.entry.has_private_key);
        assert_eq!(c.entry.chain_len, 2);
        assert_eq!(c.chain[0], pki.leaf_der);
        assert_eq!(c.chain[1], pki.ca_der);
        assert_eq!(c.entry.id, CredentialId::from_leaf_der(&pki.leaf_der));
        assert!(c.entry.subject.contains("Alice Example"));
        assert!(c.entry.issuer.contains("Test Root CA"));
    }

    #[test]
    fn export_reopens_with_the_import_password() {
        let pki = TestPki::new("Alice Example");
        let creds = open(&pki.bundle("pw"), "pw").unwrap();
        let export = creds[0].export.as_ref().unwrap();
        assert_eq!(creds[0].entry.size, export.len() as u64);

        let again = open(export, "pw").unwrap();
        assert_eq!(again[0].entry.id, creds[0].entry.id);
        assert_eq!(again[0].entry.chain_len, 2);
    }

    #[test]
    fn wrong_password_is_distinguished_from_corruption() {
        let pki = TestPki::new("Alice Example");
        let der = pki.bundle("correct");
        assert!(matches!(open(&der, "wrong"), Err(BundleError::BadPassword)));
        assert!(matches!(
            open(b"definitely not der", "correct"),
            Err(BundleError::Corrupt(_))
        ));
    }

    #[test]
    fn openssl3_default_bundle_opens() {
        // PBES2 with AES-256-CBC and an HMAC-SHA256 MAC.
        let creds = open(MODERN, "correct").unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].entry.friendly_name, "Alice Fixture");
        assert!(creds[0].entry.has_private_key);
        assert_eq!(creds[0].entry.chain_len, 2);
        assert!(creds[0].entry.issuer.contains("Fixture Root CA"));

        assert!(matches!(open(MODERN, "wrong"), Err(BundleError::BadPassword)));
    }

    #[test]
    fn legacy_sha1_bundle_opens() {
        let creds = open(LEGACY, "correct").unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].entry.friendly_name, "Alice Fixture");
        assert!(matches!(open(LEGACY, "wrong"), Err(BundleError::BadPassword)));
    }

    #[test]
    fn bundle_without_mac_reports_wrong_password_on_decrypt_failure() {
        let creds = open(NO_MAC, "correct").unwrap();
        assert_eq!(creds[0].entry.friendly_name, "Alice Fixture");
        assert!(matches!(open(NO_MAC, "wrong"), Err(BundleError::BadPassword)));
    }

    #[test]
    fn key_pairs_with_its_own_certificate_not_the_first_one() {
        let creds = open(BOB_THEN_ALICE, "correct").unwrap();
        assert_eq!(creds.len(), 1, "unkeyed certificates are not installed");
        let alice = &creds[0];
        assert_eq!(alice.entry.friendly_name, "Alice Fixture");
        assert!(alice.entry.has_private_key);
        assert_eq!(alice.entry.chain_len, 2);
        assert!(alice.entry.subject.contains("Alice Fixture"));
    }

    #[test]
    fn two_identities_keep_their_own_keys() {
        let alice = TestPki::new("Alice Example");
        let bob = TestPki::new("Bob Example");
        // Aliases sort Bob's bags ahead of Alice's.
        let der = bundle_of(
            &[
                ("b-alice", alice.key_entry(b"alice")),
                ("a-bob", bob.key_entry(b"bob")),
            ],
            "pw",
        );

        let creds = open(&der, "pw").unwrap();
        assert_eq!(creds.len(), 2);
        for (pki, name) in [(&alice, "Alice Example"), (&bob, "Bob Example")] {
            let cred = creds
                .iter()
                .find(|c| c.entry.friendly_name == name)
                .unwrap();
            assert_eq!(cred.chain[0], pki.leaf_der);
            assert_eq!(
                cred.private_key.as_ref().unwrap().as_slice(),
                pki.leaf_key_der.as_slice()
            );
        }
    }

    #[test]
    fn trusted_certificate_is_certificate_only() {
        let pki = TestPki::new("Bob");
        let entry = KeyStoreEntry::Certificate(Certificate::from_der(&pki.leaf_der).unwrap());
        let der = bundle_of(&[("bob", entry)], "pw");

        let creds = open(&der, "pw").unwrap();
        assert_eq!(creds.len(), 1);
        let cred = &creds[0];
        assert!(!cred.entry.has_private_key);
        assert!(cred.export.is_none());
        assert_eq!(cred.entry.size, pki.leaf_der.len() as u64);
        assert_eq!(cred.entry.friendly_name, "Bob");
    }

    #[test]
    fn bundle_without_chain_is_single_credential() {
        let pki = TestPki::new("Carol");
        let entry = key_entry_of(&pki.leaf_der, &pki.leaf_key_der, &[], b"carol");
        let creds = open(&bundle_of(&[("carol", entry)], "pw"), "pw").unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].entry.chain_len, 1);
    }

    #[test]
    fn bundle_with_nothing_installable_is_corrupt() {
        let der = bundle_of(&[], "pw");
        assert!(matches!(open(&der, "pw"), Err(BundleError::Corrupt(_))));
    }

    #[test]
    fn error_labels_are_user_facing() {
        assert_eq!(
            BundleError::BadPassword.kind(),
            keyshare_core::ErrorKind::BadPassword
        );
        assert_eq!(
            BundleError::Corrupt("x".into()).kind(),
            keyshare_core::ErrorKind::CorruptBundle
        );
        assert!(!BundleError::BadPassword.user_label().is_empty());
    }
}

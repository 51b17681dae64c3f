//! Test fixtures: a throwaway CA, a leaf signed by it, and PKCS#12 bundles
//! built from them.

use p12_keystore::{Certificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

pub(crate) struct TestPki {
    pub ca_der: Vec<u8>,
    pub leaf_der: Vec<u8>,
    pub leaf_key_der: Vec<u8>,
}

impl TestPki {
    pub fn new(common_name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "Test Root CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec!["client.example".to_string()]).unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        Self {
            ca_der: ca.der().to_vec(),
            leaf_der: leaf.der().to_vec(),
            leaf_key_der: leaf_key.serialize_der(),
        }
    }

    /// Key entry for leaf + CA, tagged with `local_key_id`.
    pub fn key_entry(&self, local_key_id: &[u8]) -> KeyStoreEntry {
        key_entry_of(&self.leaf_der, &self.leaf_key_der, &[self.ca_der.as_slice()], local_key_id)
    }

    /// Leaf + key + CA, protected by `password`.
    pub fn bundle(&self, password: &str) -> Vec<u8> {
        bundle_of(&[("test", self.key_entry(b"leaf"))], password)
    }
}

pub(crate) fn key_entry_of(
    cert: &[u8],
    key: &[u8],
    cas: &[&[u8]],
    local_key_id: &[u8],
) -> KeyStoreEntry {
    let chain = std::iter::once(cert)
        .chain(cas.iter().copied())
        .map(|der| Certificate::from_der(der).unwrap())
        .collect::<Vec<_>>();
    KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(key, local_key_id, chain))
}

/// PKCS#12 bundle holding `entries` under their aliases.
pub(crate) fn bundle_of(entries: &[(&str, KeyStoreEntry)], password: &str) -> Vec<u8> {
    let mut keystore = KeyStore::new();
    for (alias, entry) in entries {
        keystore.add_entry(alias, entry.clone());
    }
    keystore.writer(password).write().unwrap()
}

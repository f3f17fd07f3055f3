//! Runtime certificate generation for end-to-end tests.
//!
//! Builds a throwaway CA plus server and client certificates with rcgen, so
//! mTLS tests never depend on files checked into the repository. Two client
//! identities are generated: most tests use the first, conflict tests need a
//! second one.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use backhaul_proto::Identity;

/// A complete certificate set for one test server and two clients.
#[derive(Clone)]
pub struct TestCertificates {
    pub ca_cert_pem: String,

    pub server_cert_pem: String,
    pub server_key_pem: String,

    pub client_cert_pem: String,
    pub client_key_pem: String,

    pub second_client_cert_pem: String,
    pub second_client_key_pem: String,
}

impl TestCertificates {
    /// Generates the CA, a server certificate with localhost SANs, and two
    /// client certificates signed by the CA.
    pub fn generate() -> TestCertificates {
        let ca_key = KeyPair::generate().expect("failed to generate CA key");

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "Backhaul Test CA");
            dn
        };
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .expect("failed to create CA cert");
        let ca_issuer = Issuer::new(ca_params, ca_key);

        let server_key = KeyPair::generate().expect("failed to generate server key");
        let mut server_params = CertificateParams::default();
        server_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "localhost");
            dn
        };
        server_params.subject_alt_names = vec![
            rcgen::SanType::DnsName("localhost".try_into().unwrap()),
            rcgen::SanType::IpAddress(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
            rcgen::SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        server_params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params
            .signed_by(&server_key, &ca_issuer)
            .expect("failed to create server cert");

        let (client_cert_pem, client_key_pem) = client_cert(&ca_issuer, "test-client");
        let (second_client_cert_pem, second_client_key_pem) =
            client_cert(&ca_issuer, "second-test-client");

        TestCertificates {
            ca_cert_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            client_cert_pem,
            client_key_pem,
            second_client_cert_pem,
            second_client_key_pem,
        }
    }

    /// Identity of the first client certificate.
    pub fn client_identity(&self) -> Identity {
        identity_of(&self.client_cert_pem)
    }

    /// Identity of the second client certificate.
    pub fn second_client_identity(&self) -> Identity {
        identity_of(&self.second_client_cert_pem)
    }
}

fn client_cert(ca_issuer: &Issuer<'_, KeyPair>, common_name: &str) -> (String, String) {
    let key = KeyPair::generate().expect("failed to generate client key");
    let mut params = CertificateParams::default();
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn
    };
    params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
    let cert = params
        .signed_by(&key, ca_issuer)
        .expect("failed to create client cert");
    (cert.pem(), key.serialize_pem())
}

fn identity_of(cert_pem: &str) -> Identity {
    let der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .next()
        .expect("no certificate in PEM")
        .expect("failed to parse certificate");
    Identity::from_cert_der(&der)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_identities() {
        let certs = TestCertificates::generate();
        assert!(certs.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(certs.server_key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(certs.client_identity(), certs.second_client_identity());
    }
}

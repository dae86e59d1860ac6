use std::sync::{Arc, OnceLock};

use rustls::client::danger::{
	HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};

static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();

fn install_provider() {
	PROVIDER_INSTALLED.get_or_init(|| {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
	});
}

/// Build the rustls client config shared by DoT, DoH/3 and DoQ.
///
/// With `insecure` the certificate chain and hostname checks are skipped
/// entirely, mirroring the `--insecure` flag semantics of the CLI.
pub fn client_config(insecure: bool, alpn: Option<&[u8]>) -> ClientConfig {
	install_provider();

	let mut config = if insecure {
		ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerification::new()))
			.with_no_client_auth()
	} else {
		let mut root_store = RootCertStore::empty();
		root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
		ClientConfig::builder()
			.with_root_certificates(root_store)
			.with_no_client_auth()
	};

	if let Some(alpn) = alpn {
		config.alpn_protocols = vec![alpn.to_vec()];
	}

	config
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct NoVerification {
	provider: CryptoProvider,
}

impl NoVerification {
	fn new() -> Self {
		NoVerification {
			provider: rustls::crypto::aws_lc_rs::default_provider(),
		}
	}
}

impl ServerCertVerifier for NoVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, Error> {
		rustls::crypto::verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, Error> {
		rustls::crypto::verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.provider
			.signature_verification_algorithms
			.supported_schemes()
	}
}

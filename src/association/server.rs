use super::negotiation::NegotiatedContext;
use super::worker::{Handshake, UlAssociation, UpperLayer};
use super::AssociationError;
use crate::types::AE;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{Pdu, PresentationContextResultReason};
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::Duration;
use tracing::{info, warn};

pub struct ServerAssociationOptions {
	pub aet: AE,
	pub tcp_stream: TcpStream,
	/// Only accept transfer syntaxes that need no codec.
	pub uncompressed: bool,
	pub max_pdu_length: u32,
	/// How long the peer may take to complete the handshake.
	pub timeout: Duration,
}

/// Accepts the association the peer requests on the stream.
pub async fn accept(options: ServerAssociationOptions) -> Result<UlAssociation, AssociationError> {
	let ServerAssociationOptions {
		aet,
		tcp_stream,
		uncompressed,
		max_pdu_length,
		timeout,
	} = options;

	let server_options = TransferSyntaxRegistry
		.iter()
		.filter(|ts| {
			if uncompressed {
				ts.is_codec_free()
			} else {
				!ts.is_unsupported()
			}
		})
		.fold(
			dicom::ul::ServerAssociationOptions::new()
				.ae_title(aet.clone())
				.max_pdu_length(max_pdu_length)
				.promiscuous(true),
			|server_options, ts| server_options.with_transfer_syntax(ts.uid()),
		);

	UlAssociation::spawn(format!("{aet}-server"), timeout, move || {
		let mut association = server_options.establish(tcp_stream)?;
		let peer_aet = association.client_ae_title().trim().to_owned();
		info!(calling_aet = peer_aet, called_aet = aet, "Accepted association");

		let contexts: Vec<NegotiatedContext> = association
			.presentation_contexts()
			.iter()
			.filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
			.map(|pc| NegotiatedContext {
				id: pc.id,
				abstract_syntax: pc.abstract_syntax.clone(),
				transfer_syntax: pc.transfer_syntax.clone(),
			})
			.collect();
		let max_pdu_length = association.requestor_max_pdu_length();

		let stream = match association.inner_stream().try_clone() {
			Ok(stream) => stream,
			Err(source) => {
				UpperLayer::abort(association);
				return Err(AssociationError::Connect { node: peer_aet, source });
			}
		};

		let handshake = Handshake {
			peer_aet,
			contexts,
			max_pdu_length,
			stream,
		};
		Ok((association, handshake))
	})
	.await
}

impl UpperLayer for dicom::ul::ServerAssociation<TcpStream> {
	fn send(&mut self, pdu: &Pdu) -> Result<(), AssociationError> {
		dicom::ul::ServerAssociation::send(self, pdu).map_err(AssociationError::Association)
	}

	fn receive(&mut self) -> Result<Pdu, AssociationError> {
		dicom::ul::ServerAssociation::receive(self).map_err(AssociationError::Association)
	}

	/// The acceptor cannot initiate a release, the association is aborted instead.
	fn release(self) -> Result<(), AssociationError> {
		UpperLayer::abort(self);
		Ok(())
	}

	fn abort(self) {
		match dicom::ul::ServerAssociation::abort(self) {
			Ok(()) => {}
			// The peer closed the stream first.
			Err(dicom::ul::association::Error::WireSend { source, .. })
				if source.kind() == ErrorKind::BrokenPipe => {}
			Err(err) => warn!("Failed to abort association: {err}"),
		}
	}
}

use super::negotiation::NegotiatedContext;
use super::worker::{Handshake, UlAssociation, UpperLayer};
use super::{AssociationError, AssociationRequest, Connector};
use dicom::ul::pdu::{PDataValueType, PresentationContextResultReason};
use dicom::ul::Pdu;
use std::io::Write;
use tracing::debug;

/// Connects to remote nodes using the upper layer implementation of `dicom-ul`.
///
/// Role selection and extended negotiation items are part of the proposal but are not
/// transmitted by this connector. TLS is not supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct DicomUlConnector;

impl Connector for DicomUlConnector {
	type Association = UlAssociation;

	async fn connect(&self, request: AssociationRequest) -> Result<UlAssociation, AssociationError> {
		request.node.validate()?;
		if request.node.tls.is_some() {
			return Err(AssociationError::TlsUnsupported);
		}

		let mut options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(request.calling_aet.clone())
			.called_ae_title(request.node.aet.clone())
			.max_pdu_length(request.max_pdu_length);
		for context in &request.contexts {
			if context.role.is_some() || context.extended_negotiation.is_some() {
				debug!(
					abstract_syntax = context.abstract_syntax,
					"Role selection and extended negotiation are not transmitted"
				);
			}
			options = options.with_presentation_context(
				context.abstract_syntax.clone(),
				context.transfer_syntaxes.clone(),
			);
		}

		let name = format!("{}-client", request.calling_aet);
		let AssociationRequest {
			node,
			contexts: proposal,
			timeout,
			..
		} = request;

		UlAssociation::spawn(name, timeout, move || {
			let mut association = options.establish((node.host.as_str(), node.port))?;

			// The acceptor echoes the context id, the abstract syntax is looked up in the proposal.
			let contexts: Vec<NegotiatedContext> = association
				.presentation_contexts()
				.iter()
				.filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
				.filter_map(|pc| {
					proposal.get(pc.id).map(|proposed| NegotiatedContext {
						id: pc.id,
						abstract_syntax: proposed.abstract_syntax.clone(),
						transfer_syntax: pc.transfer_syntax.clone(),
					})
				})
				.collect();
			let max_pdu_length = association.acceptor_max_pdu_length();

			let stream = match association.inner_stream().try_clone() {
				Ok(stream) => stream,
				Err(source) => {
					UpperLayer::abort(association);
					return Err(AssociationError::Connect {
						node: node.to_string(),
						source,
					});
				}
			};

			let handshake = Handshake {
				peer_aet: node.aet.clone(),
				contexts,
				max_pdu_length,
				stream,
			};
			Ok((association, handshake))
		})
		.await
	}
}

impl UpperLayer for dicom::ul::ClientAssociation<std::net::TcpStream> {
	fn send(&mut self, pdu: &Pdu) -> Result<(), AssociationError> {
		// Data sets larger than the acceptor's limit are split into several P-DATA-TF PDUs.
		if let Pdu::PData { data } = pdu {
			let is_command = data
				.first()
				.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
			let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
			if !is_command && data_length > self.acceptor_max_pdu_length() as usize {
				for pdv in data {
					let mut writer = self.send_pdata(pdv.presentation_context_id);
					writer
						.write_all(&pdv.data)
						.map_err(AssociationError::ChunkWriter)?;
				}
				return Ok(());
			}
		}
		dicom::ul::ClientAssociation::send(self, pdu).map_err(AssociationError::Association)
	}

	fn receive(&mut self) -> Result<Pdu, AssociationError> {
		dicom::ul::ClientAssociation::receive(self).map_err(AssociationError::Association)
	}

	fn release(self) -> Result<(), AssociationError> {
		dicom::ul::ClientAssociation::release(self).map_err(AssociationError::Association)
	}

	fn abort(self) {
		if let Err(err) = dicom::ul::ClientAssociation::abort(self) {
			debug!("Failed to abort association: {err}");
		}
	}
}

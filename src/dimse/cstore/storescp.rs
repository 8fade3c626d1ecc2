use super::StoreHandler;
use crate::association::server::{self, ServerAssociationOptions};
use crate::association::{ActiveAssociation, Association};
use crate::dimse::dispatcher::DispatchError;
use crate::dimse::ncommand::EventReportHandler;
use crate::dimse::{Dispatcher, ReadError};
use crate::types::AE;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

#[derive(Debug, Clone)]
pub struct StoreServiceClassProviderOptions {
	pub aet: AE,
	pub interface: IpAddr,
	pub port: u16,
	/// Only accept uncompressed transfer syntaxes.
	pub uncompressed: bool,
	pub max_pdu_length: u32,
	/// How long an idle association is kept open.
	pub timeout: Duration,
}

/// Accepts associations from peers and answers C-ECHO, C-STORE and N-EVENT-REPORT requests.
/// Instances go to the store handler, event reports (e.g. storage commitment results) to the
/// event handler.
pub struct StoreServiceClassProvider {
	inner: Arc<InnerStoreServiceClassProvider>,
}

struct InnerStoreServiceClassProvider {
	options: StoreServiceClassProviderOptions,
	dispatcher: Dispatcher,
}

impl StoreServiceClassProvider {
	pub fn new(
		options: StoreServiceClassProviderOptions,
		store_handler: Arc<dyn StoreHandler>,
		event_handler: Option<Arc<dyn EventReportHandler>>,
	) -> Self {
		let mut dispatcher = Dispatcher::new(options.timeout).with_store_handler(store_handler);
		if let Some(event_handler) = event_handler {
			dispatcher = dispatcher.with_event_handler(event_handler);
		}
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider {
				options,
				dispatcher,
			}),
		}
	}

	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.options.interface, self.inner.options.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started Store Service Class Provider on {}", address);
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!(
						"STORE-SCP",
						aet = &self.inner.options.aet,
						peer = peer.to_string()
					);
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, inner).instrument(span).await {
							error!("{err}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// dicom-ul reads and writes blocking, on the thread of the association.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.options.aet.clone(),
			tcp_stream,
			uncompressed: inner.options.uncompressed,
			max_pdu_length: inner.options.max_pdu_length,
			timeout: inner.dispatcher.timeout(),
		};
		let association = server::accept(options).await?;
		let calling_aet = association.peer_aet().to_owned();
		let association = ActiveAssociation::new(association, calling_aet, &inner.options.aet);

		let handled = serve(&association, &inner.dispatcher).await?;
		info!(
			calling_aet = association.calling_aet(),
			handled, "Association ended"
		);
		Ok(())
	}
}

/// Answers requests on an accepted association until the peer releases or aborts it.
/// Returns the number of handled requests.
pub async fn serve<A: Association>(
	association: &ActiveAssociation<A>,
	dispatcher: &Dispatcher,
) -> Result<usize, DispatchError> {
	let mut handled = 0;
	loop {
		let message = match association.read_message(dispatcher.timeout()).await {
			Ok(message) => message,
			Err(ReadError::Released) => {
				debug!("Peer released the association");
				return Ok(handled);
			}
			Err(ReadError::Aborted) => {
				debug!("Peer aborted the association");
				return Ok(handled);
			}
			Err(err) => return Err(err.into()),
		};

		let command_field = message.command_field();
		if dispatcher
			.respond(association, association.calling_aet(), message, None)
			.await?
		{
			handled += 1;
		} else {
			warn!(command_field, "Unsupported DIMSE request");
		}
	}
}

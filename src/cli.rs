use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use dicom::core::ops::{ApplyOp, AttributeAction, AttributeOp};
use dicom::core::PrimitiveValue;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, FileDicomObject, InMemDicomObject};
use dicom_json::DicomJson;
use dicom_relay::association::DicomUlConnector;
use dicom_relay::config::AppConfig;
use dicom_relay::dimse::cecho::EchoServiceClassUser;
use dicom_relay::dimse::cfind::findscu::{FindServiceClassUser, FindServiceClassUserOptions};
use dicom_relay::dimse::cget::getscu::{GetServiceClassUser, GetServiceClassUserOptions};
use dicom_relay::dimse::cmove::movescu::{MoveServiceClassUser, MoveServiceClassUserOptions};
use dicom_relay::dimse::cstore::storescp::StoreServiceClassProvider;
use dicom_relay::dimse::cstore::storescu::StoreServiceClassUser;
use dicom_relay::dimse::cstore::{DirectoryStore, StoreHandler};
use dicom_relay::dimse::ncommand::commitment::{
	CommitmentEventHandler, CommitmentMediator, InstanceReference, StorageCommitmentOptions,
	StorageCommitmentServiceClassUser,
};
use dicom_relay::dimse::ncommand::mpps::{MppsServiceClassUser, ProcedureStepStatus};
use dicom_relay::dimse::RemoteEntity;
use dicom_relay::forward::{AttributeEdits, ForwardDestination, ForwardStoreHandler, RetrieveForwardSession};
use dicom_relay::progress::{Progress, Status};
use dicom_relay::types::{parse_attribute, trim_uid, Priority, QueryInformationModel, QueryRetrieveLevel, AE, UI};
use futures::TryStreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// A DICOM network toolkit.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
	/// Configuration file, read instead of config.toml
	#[arg(short, long, global = true)]
	pub config: Option<String>,
	/// Calling AE title, overrides the configured one
	#[arg(long, global = true)]
	pub aet: Option<AE>,
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Verifies the connection to a node with C-ECHO
	Echo {
		/// Configured node name or AET@host:port
		node: String,
	},
	/// Queries a node with C-FIND and prints the matches as DICOM JSON
	Find(FindArgs),
	/// Retrieves instances with C-GET into a directory
	Get(GetArgs),
	/// Asks a node to send instances to another AE title with C-MOVE
	Move(MoveArgs),
	/// Sends DICOM files with C-STORE
	Store(StoreArgs),
	/// Retrieves instances with C-GET and forwards them to another node
	Forward(ForwardArgs),
	/// Requests storage commitment for DICOM files
	Commit(CommitArgs),
	/// Creates or updates a modality performed procedure step
	#[command(subcommand)]
	Mpps(MppsCommand),
	/// Accepts associations and stores or forwards received instances
	Scp(ScpArgs),
}

#[derive(Args, Debug)]
pub struct QueryArgs {
	/// Configured node name or AET@host:port
	pub node: String,
	/// Information model: study, patient or worklist
	#[arg(short, long, default_value = "study")]
	pub model: QueryInformationModel,
	/// Query/retrieve level: patient, study, series or image
	#[arg(short, long)]
	pub level: Option<QueryRetrieveLevel>,
	/// Keys as Keyword=Value, tag=value or a bare keyword for a return key
	#[arg(short, long = "key")]
	pub keys: Vec<String>,
	/// Priority: low, medium or high
	#[arg(short, long, default_value = "medium")]
	pub priority: Priority,
}

#[derive(Args, Debug)]
pub struct FindArgs {
	#[command(flatten)]
	pub query: QueryArgs,
	/// Send a C-CANCEL after this many matches
	#[arg(long)]
	pub cancel_after: Option<usize>,
	/// Announce relational queries
	#[arg(long)]
	pub relational: bool,
}

#[derive(Args, Debug)]
pub struct GetArgs {
	#[command(flatten)]
	pub query: QueryArgs,
	/// Directory for the retrieved instances
	#[arg(short, long, default_value = ".")]
	pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct MoveArgs {
	#[command(flatten)]
	pub query: QueryArgs,
	/// AE title of the move destination
	#[arg(short, long)]
	pub destination: AE,
}

#[derive(Args, Debug)]
pub struct StoreArgs {
	/// Configured node name or AET@host:port
	pub node: String,
	/// Files or directories
	#[arg(required = true)]
	pub paths: Vec<PathBuf>,
	#[arg(short, long, default_value = "medium")]
	pub priority: Priority,
}

#[derive(Args, Debug)]
pub struct ForwardArgs {
	#[command(flatten)]
	pub query: QueryArgs,
	/// Configured node name or AET@host:port of the forward destination
	#[arg(short, long)]
	pub destination: String,
	/// Transfer syntax of the forwarded instances
	#[arg(short, long)]
	pub transfer_syntax: Option<UI>,
	/// SOP classes proposed before the first instance arrives
	#[arg(long = "sop-class")]
	pub sop_classes: Vec<UI>,
	/// Attribute edits as Keyword=Value, a bare keyword removes the attribute
	#[arg(short, long = "edit")]
	pub edits: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CommitArgs {
	/// Configured node name or AET@host:port
	pub node: String,
	/// Files or directories with the instances to commit
	#[arg(required = true)]
	pub paths: Vec<PathBuf>,
	/// Seconds to wait for the result
	#[arg(short, long, default_value_t = 60)]
	pub wait: u64,
	/// Wait for the result on a new association accepted by the store service class provider
	#[arg(long)]
	pub separate_association: bool,
}

#[derive(Subcommand, Debug)]
pub enum MppsCommand {
	/// Starts a procedure step with N-CREATE
	Create {
		node: String,
		/// Attributes as Keyword=Value
		#[arg(short, long = "key")]
		keys: Vec<String>,
		/// SOP instance UID of the procedure step, generated if not set
		#[arg(long)]
		uid: Option<UI>,
	},
	/// Completes or discontinues a procedure step with N-SET
	Set {
		node: String,
		/// SOP instance UID of the procedure step
		uid: UI,
		/// completed or discontinued
		#[arg(short, long)]
		status: ProcedureStepStatus,
		/// Attributes as Keyword=Value
		#[arg(short, long = "key")]
		keys: Vec<String>,
	},
}

#[derive(Args, Debug)]
pub struct ScpArgs {
	/// AE title of the service class provider
	#[arg(long)]
	pub scp_aet: Option<AE>,
	#[arg(long)]
	pub port: Option<u16>,
	/// Directory for received instances
	#[arg(short, long, default_value = ".")]
	pub output: PathBuf,
	/// Forward received instances to this node instead of storing them
	#[arg(short, long)]
	pub forward: Option<String>,
}

impl Cli {
	pub async fn run(self, mut config: AppConfig) -> anyhow::Result<()> {
		if let Some(aet) = self.aet {
			config.aet = aet;
		}

		match self.command {
			Command::Echo { node } => {
				let echoscu = EchoServiceClassUser::new(remote(&config, &node)?);
				report("C-ECHO", &echoscu.echo().await?)
			}
			Command::Find(args) => find(&config, args).await,
			Command::Get(args) => {
				let getscu = GetServiceClassUser::new(remote(&config, &args.query.node)?);
				let handler: Arc<dyn StoreHandler> = Arc::new(DirectoryStore::new(args.output));
				let options = get_options(&config, args.query)?;
				let progress = cancel_on_interrupt(Progress::new());
				report("C-GET", &getscu.get(options, handler, &progress).await?)
			}
			Command::Move(args) => {
				let movescu = MoveServiceClassUser::new(remote(&config, &args.query.node)?);
				let options = MoveServiceClassUserOptions {
					query_information_model: args.query.model,
					identifier: identifier(&args.query.keys, args.query.level)?,
					priority: args.query.priority,
					destination: args.destination,
				};
				let progress = cancel_on_interrupt(Progress::new());
				report("C-MOVE", &movescu.invoke(options, &progress).await?)
			}
			Command::Store(args) => {
				let storescu = StoreServiceClassUser::new(remote(&config, &args.node)?);
				let files = open_files(&args.paths)?;
				let progress = cancel_on_interrupt(Progress::new());
				report("C-STORE", &storescu.store(files, args.priority, &progress).await?)
			}
			Command::Forward(args) => forward(&config, args).await,
			Command::Commit(args) => commit(&config, args).await,
			Command::Mpps(command) => mpps(&config, command).await,
			Command::Scp(args) => scp(config, args).await,
		}
	}
}

fn remote(config: &AppConfig, node: &str) -> anyhow::Result<RemoteEntity<DicomUlConnector>> {
	let node = config.node(node)?;
	Ok(RemoteEntity::new(
		DicomUlConnector,
		node,
		config.association_options(),
		config.timeout(),
	))
}

/// Builds a query identifier or an attribute list from `Keyword=Value` assignments.
fn identifier(keys: &[String], level: Option<QueryRetrieveLevel>) -> anyhow::Result<InMemDicomObject> {
	let mut identifier = InMemDicomObject::new_empty();
	if let Some(level) = level {
		identifier.apply(AttributeOp::new(
			tags::QUERY_RETRIEVE_LEVEL,
			AttributeAction::Set(PrimitiveValue::from(level)),
		))?;
	}
	for key in keys {
		let (tag, value) = parse_attribute(key).map_err(anyhow::Error::msg)?;
		let value = if value.is_empty() {
			PrimitiveValue::Empty
		} else {
			PrimitiveValue::from(value)
		};
		identifier.apply(AttributeOp::new(tag, AttributeAction::Set(value)))?;
	}
	Ok(identifier)
}

fn get_options(config: &AppConfig, query: QueryArgs) -> anyhow::Result<GetServiceClassUserOptions> {
	Ok(GetServiceClassUserOptions {
		query_information_model: query.model,
		identifier: identifier(&query.keys, query.level)?,
		priority: query.priority,
		storage_sop_classes: config.retrieve.storage_sop_classes(),
		transfer_syntaxes: config.retrieve.transfer_syntaxes(),
	})
}

/// Requests cancellation of the running operation on Ctrl+C.
fn cancel_on_interrupt(progress: Progress) -> Progress {
	let cancel = progress.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("Interrupted, cancelling");
			cancel.cancel();
		}
	});
	progress
}

fn report(operation: &str, status: &Status) -> anyhow::Result<()> {
	info!(
		code = %format!("{:#06X}", status.code),
		completed = status.counters.completed,
		warning = status.counters.warning,
		failed = status.counters.failed,
		matches = status.matches.len(),
		bytes = status.bytes,
		connect = ?status.timings.connect,
		total = ?status.timings.total,
		cancelled = status.cancelled,
		"{operation} finished ({:?})",
		status.status_type()
	);
	if !status.is_success() {
		bail!("{operation} failed: {}", status.message);
	}
	Ok(())
}

async fn find(config: &AppConfig, args: FindArgs) -> anyhow::Result<()> {
	let findscu = FindServiceClassUser::new(remote(config, &args.query.node)?);
	let mut options = FindServiceClassUserOptions::new(
		args.query.model,
		identifier(&args.query.keys, args.query.level)?,
	);
	options.priority = args.query.priority;
	options.relational = args.relational;
	options.cancel_after = args.cancel_after.or(config.dimse.cancel_after);

	let progress = cancel_on_interrupt(Progress::counting());
	let stream = findscu.invoke(options, progress.clone());
	futures::pin_mut!(stream);
	while let Some(identifier) = stream.try_next().await? {
		println!("{}", serde_json::to_string(&DicomJson::from(identifier))?);
	}
	report("C-FIND", &progress.finalize())
}

async fn forward(config: &AppConfig, args: ForwardArgs) -> anyhow::Result<()> {
	let source = remote(config, &args.query.node)?;
	let mut forward_options = config.forward_options();
	if args.transfer_syntax.is_some() {
		forward_options.transfer_syntax = args.transfer_syntax;
	}
	forward_options.sop_classes.extend(args.sop_classes);

	let destination = ForwardDestination::spawn(
		DicomUlConnector,
		config.node(&args.destination)?,
		config.association_options(),
		forward_options,
	)?;
	let mut handler = ForwardStoreHandler::new(destination, config.timeout())
		.with_priority(args.query.priority);
	let edits = AttributeEdits::parse(config.forward.edits.iter().chain(&args.edits))?;
	if !edits.is_empty() {
		info!(edits = edits.len(), "Editing forwarded instances");
		handler = handler.with_editor(Arc::new(edits));
	}

	let options = get_options(config, args.query)?;
	let progress = cancel_on_interrupt(Progress::new());
	let outcome = RetrieveForwardSession::new(source, handler)
		.run(options, &progress)
		.await?;
	report("C-GET", &outcome.retrieve)?;
	report("Forward", &outcome.forward)
}

async fn commit(config: &AppConfig, args: CommitArgs) -> anyhow::Result<()> {
	let instances: Vec<InstanceReference> = open_files(&args.paths)?
		.iter()
		.map(|file| InstanceReference {
			sop_class_uid: UI::from(trim_uid(file.meta().media_storage_sop_class_uid())),
			sop_instance_uid: UI::from(trim_uid(file.meta().media_storage_sop_instance_uid())),
		})
		.collect();
	let mediator = CommitmentMediator::new();

	// The peer opens a new association towards us to report the result.
	let listener = if args.separate_association {
		let provider = StoreServiceClassProvider::new(
			config.scp_options(),
			Arc::new(DirectoryStore::new(".")),
			Some(Arc::new(CommitmentEventHandler::new(mediator.clone()))),
		);
		Some(tokio::spawn(async move { provider.spawn().await }))
	} else {
		None
	};

	let commitscu = StorageCommitmentServiceClassUser::new(remote(config, &args.node)?, mediator);
	let options = StorageCommitmentOptions {
		instances,
		transaction_uid: None,
		wait: Duration::from_secs(args.wait),
		same_association: !args.separate_association,
	};
	let progress = Progress::new();
	let result = commitscu.request(options, &progress).await;
	if let Some(listener) = listener {
		listener.abort();
	}

	let result = result?;
	for failed in &result.failed {
		warn!(
			sop_instance_uid = failed.reference.sop_instance_uid,
			reason = failed.failure_reason,
			"Instance not committed"
		);
	}
	info!(
		transaction_uid = result.transaction_uid,
		committed = result.committed.len(),
		failed = result.failed.len(),
		"Received storage commitment result"
	);
	report("Storage commitment", &progress.finalize())
}

async fn mpps(config: &AppConfig, command: MppsCommand) -> anyhow::Result<()> {
	match command {
		MppsCommand::Create { node, keys, uid } => {
			let mppsscu = MppsServiceClassUser::new(remote(config, &node)?);
			let step = mppsscu
				.create(identifier(&keys, None)?, uid, &Progress::new())
				.await?;
			println!("{}", step.sop_instance_uid);
			report("N-CREATE", &step.status)
		}
		MppsCommand::Set {
			node,
			uid,
			status,
			keys,
		} => {
			if status == ProcedureStepStatus::InProgress {
				bail!("A procedure step can only be set to COMPLETED or DISCONTINUED");
			}
			let mppsscu = MppsServiceClassUser::new(remote(config, &node)?);
			let step = mppsscu
				.set(&uid, status, identifier(&keys, None)?, &Progress::new())
				.await?;
			report("N-SET", &step.status)
		}
	}
}

async fn scp(mut config: AppConfig, args: ScpArgs) -> anyhow::Result<()> {
	if let Some(aet) = args.scp_aet {
		config.scp.aet = aet;
	}
	if let Some(port) = args.port {
		config.scp.port = port;
	}

	let mut destination = None;
	let store_handler: Arc<dyn StoreHandler> = match args.forward {
		Some(node) => {
			let forward = ForwardDestination::spawn(
				DicomUlConnector,
				config.node(&node)?,
				config.association_options(),
				config.forward_options(),
			)?;
			destination = Some(forward.clone());
			let mut handler = ForwardStoreHandler::new(forward, config.timeout());
			let edits = AttributeEdits::parse(&config.forward.edits)?;
			if !edits.is_empty() {
				handler = handler.with_editor(Arc::new(edits));
			}
			info!(destination = node, "Forwarding received instances");
			Arc::new(handler)
		}
		None => Arc::new(DirectoryStore::new(args.output)),
	};
	let event_handler = Arc::new(CommitmentEventHandler::new(CommitmentMediator::new()));
	let provider = StoreServiceClassProvider::new(config.scp_options(), store_handler, Some(event_handler));

	let result = tokio::select! {
		result = provider.spawn() => result,
		_ = tokio::signal::ctrl_c() => {
			info!("Shutting down");
			Ok(())
		}
	};
	if let Some(destination) = destination {
		destination.shutdown().await;
	}
	result
}

/// Opens the given files and the files in the given directories.
fn open_files(paths: &[PathBuf]) -> anyhow::Result<Vec<FileDicomObject<InMemDicomObject>>> {
	let mut files = Vec::new();
	let mut pending: Vec<PathBuf> = paths.to_vec();
	while let Some(path) = pending.pop() {
		if path.is_dir() {
			let entries = std::fs::read_dir(&path)
				.with_context(|| format!("Failed to read directory {}", path.display()))?;
			for entry in entries {
				pending.push(entry?.path());
			}
			continue;
		}
		match open(&path) {
			Ok(file) => files.push(file),
			Err(err) => error!("{err:#}"),
		}
	}
	if files.is_empty() {
		bail!("No DICOM files found");
	}
	Ok(files)
}

fn open(path: &Path) -> anyhow::Result<FileDicomObject<InMemDicomObject>> {
	open_file(path).with_context(|| format!("Failed to open {}", path.display()))
}

use super::{InboundObject, StoreHandler};
use crate::dimse::{decode_data_set, status};
use crate::types::{trim_uid, US};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use anyhow::Context;
use async_trait::async_trait;
use dicom::object::FileMetaTableBuilder;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Writes received instances as DICOM files into a directory.
/// The file name is the SOP Instance UID, the transfer syntax is the one the instance was
/// received with.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
	directory: PathBuf,
}

impl DirectoryStore {
	pub fn new(directory: impl Into<PathBuf>) -> Self {
		Self {
			directory: directory.into(),
		}
	}

	pub fn directory(&self) -> &Path {
		&self.directory
	}

	pub fn path_for(&self, sop_instance_uid: &str) -> PathBuf {
		let file_name: String = trim_uid(sop_instance_uid)
			.chars()
			.map(|c| if c.is_ascii_digit() || c == '.' { c } else { '_' })
			.collect();
		self.directory.join(format!("{file_name}.dcm"))
	}

	fn write(path: &Path, object: &InboundObject) -> anyhow::Result<()> {
		let data_set = decode_data_set(&object.data, &object.transfer_syntax)?;
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(trim_uid(&object.sop_class_uid))
			.media_storage_sop_instance_uid(trim_uid(&object.sop_instance_uid))
			.transfer_syntax(trim_uid(&object.transfer_syntax))
			.implementation_class_uid(IMPLEMENTATION_CLASS_UID)
			.implementation_version_name(IMPLEMENTATION_VERSION_NAME)
			.build()
			.context("Failed to build file meta information")?;

		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.with_context(|| format!("Failed to create {}", parent.display()))?;
		}
		data_set
			.with_exact_meta(meta)
			.write_to_file(path)
			.with_context(|| format!("Failed to write {}", path.display()))?;
		Ok(())
	}
}

#[async_trait]
impl StoreHandler for DirectoryStore {
	async fn store(&self, object: InboundObject) -> US {
		let path = self.path_for(&object.sop_instance_uid);
		let sop_instance_uid = object.sop_instance_uid.clone();
		let result = tokio::task::spawn_blocking(move || {
			let result = Self::write(&path, &object);
			result.map(|()| path)
		})
		.await;

		match result {
			Ok(Ok(path)) => {
				info!(sop_instance_uid, path = %path.display(), "Stored instance");
				status::SUCCESS
			}
			Ok(Err(err)) => {
				error!(sop_instance_uid, "{err:#}");
				status::OUT_OF_RESOURCES
			}
			Err(err) => {
				error!(sop_instance_uid, "Storage task failed: {err}");
				status::OUT_OF_RESOURCES
			}
		}
	}
}

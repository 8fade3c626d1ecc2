//! Presentation context proposals for outbound association requests.
//!
//! Every request starts from an empty [`PresentationContexts`] list that the service class users
//! extend for their operation. Context ids are assigned the same way the upper layer assigns them
//! on the wire: odd numbers in insertion order.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part08/sect_9.3.2.2.html>

use crate::types::{trim_uid, UI};
use dicom::dictionary_std::uids;
use thiserror::Error;

/// Presentation context ids are odd integers between 1 and 255.
pub const MAX_PRESENTATION_CONTEXTS: usize = 128;

/// Extended negotiation value announcing support for relational queries.
pub const RELATIONAL_QUERIES: [u8; 1] = [1];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
	#[error("No presentation context was accepted for abstract syntax '{0}'")]
	AbstractSyntaxRejected(UI),
	#[error("Too many presentation contexts (at most {MAX_PRESENTATION_CONTEXTS})")]
	TooManyPresentationContexts,
	#[error("A presentation context needs at least one transfer syntax")]
	MissingTransferSyntax,
}

/// SCU/SCP role selection for a presentation context.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_D.3.3.4.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
	Scu,
	Scp,
}

/// A single proposed presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContext {
	pub id: u8,
	pub abstract_syntax: UI,
	pub transfer_syntaxes: Vec<UI>,
	pub role: Option<Role>,
	pub extended_negotiation: Option<Vec<u8>>,
}

/// A presentation context as accepted by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
	pub id: u8,
	pub abstract_syntax: UI,
	pub transfer_syntax: UI,
}

/// The list of presentation contexts proposed in one A-ASSOCIATE-RQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentationContexts {
	contexts: Vec<PresentationContext>,
}

impl PresentationContexts {
	pub const fn new() -> Self {
		Self {
			contexts: Vec::new(),
		}
	}

	/// Adds a context without role selection. See [`Self::add_with_role`].
	pub fn add<I, S>(&mut self, abstract_syntax: &str, transfer_syntaxes: I) -> Result<u8, NegotiationError>
	where
		I: IntoIterator<Item = S>,
		S: Into<UI>,
	{
		self.add_with_role(abstract_syntax, transfer_syntaxes, None)
	}

	/// Adds a context for the abstract syntax and returns its id.
	/// If a context for the same abstract syntax and role already exists, the transfer syntaxes
	/// are merged into it instead of proposing a second context.
	pub fn add_with_role<I, S>(
		&mut self,
		abstract_syntax: &str,
		transfer_syntaxes: I,
		role: Option<Role>,
	) -> Result<u8, NegotiationError>
	where
		I: IntoIterator<Item = S>,
		S: Into<UI>,
	{
		let abstract_syntax = trim_uid(abstract_syntax);
		let transfer_syntaxes: Vec<UI> = transfer_syntaxes
			.into_iter()
			.map(Into::into)
			.map(|ts| UI::from(trim_uid(&ts)))
			.collect();

		if let Some(existing) = self
			.contexts
			.iter_mut()
			.find(|pc| pc.abstract_syntax == abstract_syntax && pc.role == role)
		{
			for ts in transfer_syntaxes {
				if !existing.transfer_syntaxes.contains(&ts) {
					existing.transfer_syntaxes.push(ts);
				}
			}
			return Ok(existing.id);
		}

		self.push(abstract_syntax, transfer_syntaxes, role)
	}

	/// Proposes `transfer_syntax` as the first choice for the abstract syntax and returns the id
	/// of that context.
	///
	/// Unlike [`Self::add`], this keeps a separate context for every preferred transfer syntax,
	/// followed by the uncompressed fallbacks. An acceptor that picks the first syntax it supports
	/// then accepts each syntax on its own context, so the same SOP class can be sent unchanged in
	/// several transfer syntaxes on one association.
	pub fn add_preferring(
		&mut self,
		abstract_syntax: &str,
		transfer_syntax: &str,
	) -> Result<u8, NegotiationError> {
		let abstract_syntax = trim_uid(abstract_syntax);
		if let Some(existing) = self.preferred(abstract_syntax, transfer_syntax) {
			return Ok(existing.id);
		}
		self.push(abstract_syntax, storage_transfer_syntaxes(transfer_syntax), None)
	}

	fn push(
		&mut self,
		abstract_syntax: &str,
		transfer_syntaxes: Vec<UI>,
		role: Option<Role>,
	) -> Result<u8, NegotiationError> {
		if transfer_syntaxes.is_empty() {
			return Err(NegotiationError::MissingTransferSyntax);
		}
		if self.contexts.len() >= MAX_PRESENTATION_CONTEXTS {
			return Err(NegotiationError::TooManyPresentationContexts);
		}

		let mut deduplicated = Vec::with_capacity(transfer_syntaxes.len());
		for ts in transfer_syntaxes {
			if !deduplicated.contains(&ts) {
				deduplicated.push(ts);
			}
		}

		#[allow(clippy::cast_possible_truncation)]
		let id = (self.contexts.len() * 2 + 1) as u8;
		self.contexts.push(PresentationContext {
			id,
			abstract_syntax: UI::from(abstract_syntax),
			transfer_syntaxes: deduplicated,
			role,
			extended_negotiation: None,
		});
		Ok(id)
	}

	/// Attaches an extended negotiation item to the context with the given id.
	pub fn set_extended_negotiation(&mut self, id: u8, value: Vec<u8>) {
		if let Some(pc) = self.contexts.iter_mut().find(|pc| pc.id == id) {
			pc.extended_negotiation = Some(value);
		}
	}

	/// Returns true if a context for the abstract syntax proposes the transfer syntax.
	pub fn contains(&self, abstract_syntax: &str, transfer_syntax: &str) -> bool {
		let transfer_syntax = trim_uid(transfer_syntax);
		self.contexts.iter().any(|pc| {
			pc.abstract_syntax == trim_uid(abstract_syntax)
				&& pc.transfer_syntaxes.iter().any(|ts| ts == transfer_syntax)
		})
	}

	/// The context without role selection that proposes the transfer syntax as its first choice.
	pub fn preferred(
		&self,
		abstract_syntax: &str,
		transfer_syntax: &str,
	) -> Option<&PresentationContext> {
		let abstract_syntax = trim_uid(abstract_syntax);
		let transfer_syntax = trim_uid(transfer_syntax);
		self.contexts.iter().find(|pc| {
			pc.role.is_none()
				&& pc.abstract_syntax == abstract_syntax
				&& pc.transfer_syntaxes.first().is_some_and(|ts| ts == transfer_syntax)
		})
	}

	pub fn contains_abstract_syntax(&self, abstract_syntax: &str) -> bool {
		self.contexts
			.iter()
			.any(|pc| pc.abstract_syntax == trim_uid(abstract_syntax))
	}

	pub fn get(&self, id: u8) -> Option<&PresentationContext> {
		self.contexts.iter().find(|pc| pc.id == id)
	}

	pub fn iter(&self) -> impl Iterator<Item = &PresentationContext> {
		self.contexts.iter()
	}

	pub fn len(&self) -> usize {
		self.contexts.len()
	}

	pub fn is_empty(&self) -> bool {
		self.contexts.is_empty()
	}

	/// Proposal for the Verification SOP class.
	pub fn verification() -> Self {
		let mut contexts = Self::new();
		// The list is empty, adding cannot fail.
		let _ = contexts.add(uids::VERIFICATION, [uids::IMPLICIT_VR_LITTLE_ENDIAN]);
		contexts
	}

	/// Proposal for a C-FIND information model, optionally announcing relational queries.
	pub fn for_find(abstract_syntax: &str, relational: bool) -> Result<Self, NegotiationError> {
		let mut contexts = Self::new();
		let id = contexts.add(abstract_syntax, default_transfer_syntaxes())?;
		if relational {
			contexts.set_extended_negotiation(id, RELATIONAL_QUERIES.to_vec());
		}
		Ok(contexts)
	}

	/// Proposal for a C-MOVE information model.
	pub fn for_move(abstract_syntax: &str) -> Result<Self, NegotiationError> {
		let mut contexts = Self::new();
		contexts.add(abstract_syntax, default_transfer_syntaxes())?;
		Ok(contexts)
	}

	/// Proposal for a C-GET information model.
	/// The storage SOP classes are proposed with the SCP role because the sub-operations are
	/// C-STORE requests sent by the peer on the same association.
	pub fn for_get<S: AsRef<str>>(
		abstract_syntax: &str,
		storage_sop_classes: &[S],
		storage_transfer_syntaxes: &[S],
	) -> Result<Self, NegotiationError> {
		let mut contexts = Self::new();
		contexts.add(abstract_syntax, default_transfer_syntaxes())?;
		for sop_class in storage_sop_classes {
			contexts.add_with_role(
				sop_class.as_ref(),
				storage_transfer_syntaxes.iter().map(|ts| ts.as_ref().to_owned()),
				Some(Role::Scp),
			)?;
		}
		Ok(contexts)
	}

	/// Proposal for C-STORE: one context per SOP class and transfer syntax, each with that
	/// transfer syntax first followed by the uncompressed fallback syntaxes.
	pub fn for_storage<'a, I>(objects: I) -> Result<Self, NegotiationError>
	where
		I: IntoIterator<Item = (&'a str, &'a str)>,
	{
		let mut contexts = Self::new();
		for (sop_class, transfer_syntax) in objects {
			contexts.add_preferring(sop_class, transfer_syntax)?;
		}
		Ok(contexts)
	}
}

impl<'a> IntoIterator for &'a PresentationContexts {
	type Item = &'a PresentationContext;
	type IntoIter = std::slice::Iter<'a, PresentationContext>;

	fn into_iter(self) -> Self::IntoIter {
		self.contexts.iter()
	}
}

/// Transfer syntaxes proposed for query/retrieve and normalized services.
pub fn default_transfer_syntaxes() -> Vec<UI> {
	vec![
		UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
	]
}

/// The preferred transfer syntax followed by Explicit and Implicit VR Little Endian.
pub fn storage_transfer_syntaxes(preferred: &str) -> Vec<UI> {
	let mut syntaxes = vec![UI::from(trim_uid(preferred))];
	for fallback in default_transfer_syntaxes() {
		if !syntaxes.contains(&fallback) {
			syntaxes.push(fallback);
		}
	}
	syntaxes
}

/// Finds the accepted context for exactly this abstract syntax and transfer syntax.
pub fn accepted_context<'a>(
	contexts: &'a [NegotiatedContext],
	abstract_syntax: &str,
	transfer_syntax: &str,
) -> Option<&'a NegotiatedContext> {
	let abstract_syntax = trim_uid(abstract_syntax);
	let transfer_syntax = trim_uid(transfer_syntax);
	contexts
		.iter()
		.find(|pc| pc.abstract_syntax == abstract_syntax && pc.transfer_syntax == transfer_syntax)
}

/// Finds the accepted context for an abstract syntax, preferring the given transfer syntax.
pub fn select_context<'a>(
	contexts: &'a [NegotiatedContext],
	abstract_syntax: &str,
	transfer_syntax: Option<&str>,
) -> Option<&'a NegotiatedContext> {
	let abstract_syntax = trim_uid(abstract_syntax);
	let mut candidates = contexts
		.iter()
		.filter(|pc| pc.abstract_syntax == abstract_syntax);

	match transfer_syntax.map(trim_uid) {
		Some(ts) => {
			let candidates: Vec<_> = candidates.collect();
			candidates
				.iter()
				.find(|pc| pc.transfer_syntax == ts)
				.or_else(|| candidates.first())
				.copied()
		}
		None => candidates.next(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

	#[test]
	fn assigns_odd_ids_in_insertion_order() {
		let mut contexts = PresentationContexts::new();
		let ct = contexts
			.add(uids::CT_IMAGE_STORAGE, [uids::EXPLICIT_VR_LITTLE_ENDIAN])
			.unwrap();
		let mr = contexts
			.add(uids::MR_IMAGE_STORAGE, [uids::EXPLICIT_VR_LITTLE_ENDIAN])
			.unwrap();
		assert_eq!((ct, mr), (1, 3));
	}

	#[test]
	fn merges_transfer_syntaxes_for_same_abstract_syntax() {
		let mut contexts = PresentationContexts::new();
		let first = contexts
			.add(uids::CT_IMAGE_STORAGE, [JPEG_BASELINE])
			.unwrap();
		let second = contexts
			.add(uids::CT_IMAGE_STORAGE, storage_transfer_syntaxes(uids::EXPLICIT_VR_LITTLE_ENDIAN))
			.unwrap();

		assert_eq!(first, second);
		assert_eq!(contexts.len(), 1);
		assert_eq!(
			contexts.get(first).unwrap().transfer_syntaxes,
			vec![
				UI::from(JPEG_BASELINE),
				UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
				UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			]
		);
	}

	#[test]
	fn each_preferred_syntax_gets_its_own_context() {
		let mut contexts = PresentationContexts::new();
		let explicit = contexts
			.add_preferring(uids::CT_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.unwrap();
		let jpeg = contexts
			.add_preferring(uids::CT_IMAGE_STORAGE, JPEG_BASELINE)
			.unwrap();
		let again = contexts
			.add_preferring(uids::CT_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.unwrap();

		assert_eq!((explicit, jpeg, again), (1, 3, 1));
		assert_eq!(contexts.len(), 2);
		assert_eq!(
			contexts.get(jpeg).unwrap().transfer_syntaxes,
			vec![
				UI::from(JPEG_BASELINE),
				UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
				UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			]
		);
		// Implicit VR is a fallback of the first context, not its first choice.
		assert!(contexts.contains(uids::CT_IMAGE_STORAGE, uids::IMPLICIT_VR_LITTLE_ENDIAN));
		assert!(contexts
			.preferred(uids::CT_IMAGE_STORAGE, uids::IMPLICIT_VR_LITTLE_ENDIAN)
			.is_none());
	}

	#[test]
	fn storage_proposal_keeps_one_context_per_syntax() {
		let contexts = PresentationContexts::for_storage([
			(uids::CT_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN),
			(uids::CT_IMAGE_STORAGE, JPEG_BASELINE),
			(uids::CT_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN),
			(uids::MR_IMAGE_STORAGE, uids::EXPLICIT_VR_LITTLE_ENDIAN),
		])
		.unwrap();
		assert_eq!(contexts.len(), 3);
		assert_eq!(
			contexts.preferred(uids::CT_IMAGE_STORAGE, JPEG_BASELINE).map(|pc| pc.id),
			Some(3)
		);
	}

	#[test]
	fn distinct_roles_get_distinct_contexts() {
		let mut contexts = PresentationContexts::new();
		let scu = contexts
			.add(uids::CT_IMAGE_STORAGE, default_transfer_syntaxes())
			.unwrap();
		let scp = contexts
			.add_with_role(uids::CT_IMAGE_STORAGE, default_transfer_syntaxes(), Some(Role::Scp))
			.unwrap();
		assert_ne!(scu, scp);
	}

	#[test]
	fn rejects_more_than_128_contexts() {
		let mut contexts = PresentationContexts::new();
		for i in 0..MAX_PRESENTATION_CONTEXTS {
			contexts
				.add(&format!("1.2.3.{i}"), [uids::IMPLICIT_VR_LITTLE_ENDIAN])
				.unwrap();
		}
		assert_eq!(
			contexts.add("1.2.3.999", [uids::IMPLICIT_VR_LITTLE_ENDIAN]),
			Err(NegotiationError::TooManyPresentationContexts)
		);
	}

	#[test]
	fn storage_proposal_puts_preferred_syntax_first() {
		assert_eq!(
			storage_transfer_syntaxes(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			vec![
				UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
				UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			]
		);
	}

	#[test]
	fn relational_find_carries_extended_negotiation() {
		let contexts = PresentationContexts::for_find(
			uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			true,
		)
		.unwrap();
		assert_eq!(
			contexts.get(1).unwrap().extended_negotiation,
			Some(RELATIONAL_QUERIES.to_vec())
		);
	}

	#[test]
	fn selects_context_by_transfer_syntax() {
		let negotiated = vec![
			NegotiatedContext {
				id: 1,
				abstract_syntax: UI::from(uids::CT_IMAGE_STORAGE),
				transfer_syntax: UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
			},
			NegotiatedContext {
				id: 3,
				abstract_syntax: UI::from(uids::CT_IMAGE_STORAGE),
				transfer_syntax: UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			},
		];
		let selected = select_context(
			&negotiated,
			uids::CT_IMAGE_STORAGE,
			Some(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		);
		assert_eq!(selected.map(|pc| pc.id), Some(3));
		assert!(select_context(&negotiated, uids::MR_IMAGE_STORAGE, None).is_none());

		// Falls back to another syntax, the exact lookup does not.
		assert_eq!(
			select_context(&negotiated, uids::CT_IMAGE_STORAGE, Some(JPEG_BASELINE)).map(|pc| pc.id),
			Some(1)
		);
		assert!(accepted_context(&negotiated, uids::CT_IMAGE_STORAGE, JPEG_BASELINE).is_none());
	}
}

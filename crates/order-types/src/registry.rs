//! Registry trait for self-registering implementations.

/// Ties an implementation to the name it is configured under.
///
/// Every storage backend and stream transport module exposes a `Registry`
/// struct implementing this trait, so the service can collect
/// `(NAME, factory)` pairs without naming each implementation by hand.
pub trait ImplementationRegistry {
	/// Key of the implementation's table, e.g. `"file"` for
	/// `[storage.implementations.file]`.
	const NAME: &'static str;

	/// Factory signature defined by the owning crate.
	type Factory;

	fn factory() -> Self::Factory;
}

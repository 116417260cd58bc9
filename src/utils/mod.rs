/// Provide interoperability with C return values.
pub(crate) mod interop;

#[cfg(feature = "ibverbs")]
pub(crate) mod boilerplate;

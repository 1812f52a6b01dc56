/// Crate version baked into the binary.
pub const LOGICHAIN_VERSION: &str = env!("CARGO_PKG_VERSION");

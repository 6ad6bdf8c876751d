pub(crate) mod disk;

#[cfg(feature = "manager-moka")]
pub(crate) mod moka;

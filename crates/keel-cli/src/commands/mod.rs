pub(crate) mod chat;
pub(crate) mod patch;
pub(crate) mod permissions;

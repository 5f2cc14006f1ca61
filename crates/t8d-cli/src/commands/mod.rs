pub(crate) mod auth;
pub(crate) mod list;
pub(crate) mod sync;
pub(crate) mod task;
pub(crate) mod workspace;

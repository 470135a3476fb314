pub(crate) mod assignments;
pub(crate) mod errors;
pub(crate) mod essays;
pub(crate) mod guards;
pub(crate) mod handlers;
pub(crate) mod review;
pub(crate) mod router;
pub(crate) mod rubrics;

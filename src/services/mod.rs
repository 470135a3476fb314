pub(crate) mod assignments;
pub(crate) mod errors;
pub(crate) mod extraction;
pub(crate) mod grader;
pub(crate) mod ingestion;
pub(crate) mod retention;
pub(crate) mod review;
pub(crate) mod rubric_validation;
pub(crate) mod rubrics;
pub(crate) mod storage;

pub mod apply;
pub mod levels;
pub mod normalizer;
pub mod review;

pub mod advertisement;
pub mod characteristic;
pub mod tree;

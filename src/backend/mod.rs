pub mod codegen;
pub mod ir;
pub mod link;
pub mod x86_64;

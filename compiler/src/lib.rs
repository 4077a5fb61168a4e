//! Compilación de operaciones y conversión a recursos de backend.

pub mod containers;
pub mod contexts;
pub mod converters;
pub mod error;
pub mod loader;
pub mod matrix;
pub mod resolver;
pub mod template;

pub use contexts::RunContext;
pub use converters::docker::{to_docker_plan, DockerPlan};
pub use converters::k8s::to_k8s_resource;
pub use converters::ConverterContext;
pub use error::{CompilerError, CompilerResult};
pub use loader::{ComponentLoader, MemoryLoader, PathLoader};
pub use resolver::{compile, recompile, CompileOptions};

#![forbid(unsafe_code)]

mod builtins;
mod cond;
mod construct;
mod cursor;
mod eval;
mod services;
mod state;

pub use construct::build_initial_state;
pub use cursor::StateCursor;
pub use eval::{Evaluator, ExecConfig};
pub use services::{
    BoundInference, CompiledTemplate, ContainerYield, GraphOracle, LibraryModel, MutationOracle,
    NoOracle, Services, StdLibrary, TemplateCache,
};
pub use state::{Entry, ProgramState};

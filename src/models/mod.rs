pub mod operation;
pub mod run;

pub use operation::{Operation, OperationKind, RunFields};
pub use run::{Attachment, Run, RunEvent, RunType};

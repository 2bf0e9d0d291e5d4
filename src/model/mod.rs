//! Descriptor model and the mutable working model the analysis passes annotate

mod descriptors;
mod procedure_model;

pub use descriptors::{
    FieldDescriptor, ObjectReference, ProcedureDependency, ProcedureDescriptor, ReferenceKind,
    ResultSetDescriptor,
};
pub use procedure_model::{
    ColumnModel, ExecutedProcedureRef, ExpressionKind, ProcedureModel, ResultSetModel, TableSource,
    TypeToken,
};

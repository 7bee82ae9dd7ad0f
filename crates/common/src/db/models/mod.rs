//! SeaORM entity models
//!
//! Database entities for the Scholarbot audit log

mod qa_log;

pub use qa_log::{
    ActiveModel as QaLogActiveModel,
    Column as QaLogColumn,
    Entity as QaLogEntity,
    FeedbackType,
    Model as QaLog,
};

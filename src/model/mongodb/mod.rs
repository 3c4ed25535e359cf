mod bson;
mod collection;
mod counter;
mod errors;

pub use bson::{optional_datetime, u32_id_filter, Id};
pub use collection::{ensure_indexes_exist, Coll, MongoCollection};
pub use counter::{
    ensure_id_counters_exist, Counter, CHOICE_ID_COUNTER_ID, QUESTION_ID_COUNTER_ID,
};
pub use errors::{is_duplicate_key_error, is_transient_transaction_error, is_unknown_commit_result};

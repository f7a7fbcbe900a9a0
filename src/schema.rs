// Diesel table definitions for the job store.
// Kept in sync by hand with `DieselJobStore::init_schema`.

diesel::table! {
    documents (document_id) {
        document_id -> Text,
        bucket -> Text,
        object_key -> Text,
        content_type -> Nullable<Text>,
        size_bytes -> BigInt,
        classification -> Nullable<Text>,
        job_id -> Nullable<Text>,
        status -> Text,
        attempts -> Integer,
        results_requested_at -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    outputs (document_id, output_type) {
        document_id -> Text,
        output_type -> Text,
        bucket -> Text,
        object_key -> Text,
        written_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(documents, outputs);

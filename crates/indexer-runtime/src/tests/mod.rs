//! End-to-end tests of the ingestion and confirmation pipeline

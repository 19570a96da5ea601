pub mod ulid;

mod json_queue;
mod sqlite_queue;

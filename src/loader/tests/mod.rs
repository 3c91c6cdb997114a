pub mod helpers;
mod tests_merge;

mod helpers;

mod recovery_tests;
mod reserved_tests;

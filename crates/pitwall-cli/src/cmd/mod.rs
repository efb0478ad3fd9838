pub mod check;
pub mod compact;
pub mod doctor;
pub mod init;
pub mod orchestrate;
pub mod queue;
pub mod run;
pub mod updates;

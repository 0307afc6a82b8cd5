mod lifecycle;
mod messages;
mod runner;

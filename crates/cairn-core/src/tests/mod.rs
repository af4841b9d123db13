mod backup;
mod catalog;
mod verify;
mod volume;

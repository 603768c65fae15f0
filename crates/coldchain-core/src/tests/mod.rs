mod backup;
mod catalog;
mod reconcile;

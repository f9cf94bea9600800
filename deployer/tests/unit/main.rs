mod support;
mod test_deployer;
mod test_fsm;
mod test_health;
mod test_monitoring;
mod test_rollback;
mod test_server;

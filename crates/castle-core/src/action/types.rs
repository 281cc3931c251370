//! Action type names, shared by the actions that declare them and the
//! actions that target them.

pub const INIT: &str = "init";
pub const SETUP: &str = "setup";
pub const START: &str = "start";
pub const UP: &str = "up";
pub const STATUS: &str = "status";
pub const STOP: &str = "stop";
pub const DESTROY: &str = "destroy";
pub const DOWN: &str = "down";
pub const CLEAN: &str = "clean";
pub const SAVE_LOGS: &str = "saveLogs";
pub const DESTROY_NODES: &str = "destroyNodes";

pub const DAEMON_START: &str = "daemonStart";
pub const DAEMON_STATUS: &str = "daemonStatus";
pub const DAEMON_STOP: &str = "daemonStop";

pub const ZOOKEEPER_START: &str = "zooKeeperStart";
pub const ZOOKEEPER_STATUS: &str = "zooKeeperStatus";
pub const ZOOKEEPER_STOP: &str = "zooKeeperStop";
pub const BROKER_START: &str = "brokerStart";
pub const BROKER_STATUS: &str = "brokerStatus";
pub const BROKER_STOP: &str = "brokerStop";
pub const TROGDOR_AGENT_START: &str = "trogdorAgentStart";
pub const TROGDOR_AGENT_STATUS: &str = "trogdorAgentStatus";
pub const TROGDOR_AGENT_STOP: &str = "trogdorAgentStop";
pub const TROGDOR_COORDINATOR_START: &str = "trogdorCoordinatorStart";
pub const TROGDOR_COORDINATOR_STATUS: &str = "trogdorCoordinatorStatus";
pub const TROGDOR_COORDINATOR_STOP: &str = "trogdorCoordinatorStop";

pub const JMX_START: &str = "jmxStart";
pub const JMX_STATUS: &str = "jmxStatus";
pub const JMX_STOP: &str = "jmxStop";
pub const COLLECTD_STOP: &str = "collectdStop";

pub const TASK_START: &str = "taskStart";
pub const TASK_STATUS: &str = "taskStatus";
pub const TASK_STOP: &str = "taskStop";

pub const DOCKER_INIT: &str = "dockerInit";
pub const DOCKER_DESTROY: &str = "dockerDestroy";
pub const AWS_INIT: &str = "awsInit";
pub const AWS_DESTROY: &str = "awsDestroy";
pub const UPLINK_CHECK: &str = "uplinkCheck";

/// Stop actions of every daemon, in the order they must run.
pub const DAEMON_STOPS: [&str; 6] = [
    JMX_STOP,
    TROGDOR_AGENT_STOP,
    TROGDOR_COORDINATOR_STOP,
    BROKER_STOP,
    ZOOKEEPER_STOP,
    COLLECTD_STOP,
];

//! Fixed locations on cluster nodes.

/// Root of every daemon's log directory; `saveLogs` copies it back.
pub const LOGS_ROOT: &str = "/mnt/logs";

/// Where the kafka build is mounted or installed.
pub const KAFKA_SRC: &str = "/opt/kafka-dev";

/// Where the castle distribution is mounted or installed.
pub const CASTLE_SRC: &str = "/opt/castle";

pub const KAFKA_ROOT: &str = "/mnt/kafka";
pub const KAFKA_CONF: &str = "/mnt/kafka/conf";
pub const KAFKA_DATA: &str = "/mnt/kafka/data";
pub const KAFKA_LOGS: &str = "/mnt/logs/kafka";

pub const ZK_ROOT: &str = "/mnt/zookeeper";
pub const ZK_CONF: &str = "/mnt/zookeeper/conf";
pub const ZK_DATA: &str = "/mnt/zookeeper/data";
pub const ZK_LOGS: &str = "/mnt/logs/zookeeper";

pub const TROGDOR_ROOT: &str = "/mnt/trogdor";
pub const TROGDOR_CONF: &str = "/mnt/trogdor/conf";
pub const TROGDOR_LOGS: &str = "/mnt/logs/trogdor";

pub const JMX_DUMPER_ROOT: &str = "/mnt/jmx";
pub const JMX_DUMPER_CONF: &str = "/mnt/jmx/conf";
pub const JMX_DUMPER_LOGS: &str = "/mnt/logs/jmx";
pub const JMX_DUMPER_START_SCRIPT: &str = "/opt/castle/bin/castle-jmx-dumper.sh";

/// Process name of the collectd monitoring daemon baked into node images.
pub const COLLECTD: &str = "collectd";

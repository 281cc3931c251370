//! EC2 instances, driven through a single request-batching worker.
//!
//! Callers enqueue requests and get a [`CloudFuture`] back. A dedicated
//! thread drains the queue: every enqueue pushes the next call at least
//! [`COALESCE_DELAY_MS`] into the future so that concurrent requests can be
//! batched, and every call pushes the next one [`CALL_DELAY_MS`] out to stay
//! under EC2 rate limits. One kind of request is serviced per call, in the
//! order creates, describes, describe-alls, terminates.

use std::collections::{BTreeMap, VecDeque};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{wait_all, Cloud, CloudFuture, CloudPromise};
use crate::cluster::CastleNode;

/// Minimum wait between queueing a request and servicing it.
pub const COALESCE_DELAY_MS: u64 = 20;
/// Minimum wait between two EC2 calls.
pub const CALL_DELAY_MS: u64 = 500;

pub const CASTLE_TAG_KEY: &str = "CastleNodeVersion";
pub const CASTLE_TAG_VALUE: &str = "1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2Settings {
    pub key_pair: String,
    pub security_group: String,
    pub region: String,
}

impl Ec2Settings {
    /// Cache key for the cloud serving these settings.
    pub fn description(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "Ec2Settings{{{},{},{}}}",
                self.key_pair, self.security_group, self.region
            )
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ec2InstanceInfo {
    pub instance_id: String,
    pub private_dns: String,
    pub public_dns: String,
    pub state: String,
}

/// The EC2 operations castle needs. Calls are made from the worker thread
/// only.
pub trait Ec2Api: Send {
    /// Launch `count` instances; returns their ids.
    fn run_instances(
        &mut self,
        instance_type: &str,
        image_id: &str,
        count: usize,
        settings: &Ec2Settings,
    ) -> anyhow::Result<Vec<String>>;

    fn describe_instances(&mut self, ids: &[String]) -> anyhow::Result<Vec<Ec2InstanceInfo>>;

    /// Every castle-tagged instance launched with `key_pair`.
    fn describe_all(&mut self, key_pair: &str) -> anyhow::Result<Vec<Ec2InstanceInfo>>;

    fn terminate_instances(&mut self, ids: &[String]) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum Request {
    Create {
        instance_type: String,
        image_id: String,
        promise: CloudPromise<String>,
    },
    Describe {
        instance_id: String,
        promise: CloudPromise<Ec2InstanceInfo>,
    },
    DescribeAll {
        promise: CloudPromise<Vec<Ec2InstanceInfo>>,
    },
    Terminate {
        instance_id: String,
        promise: CloudPromise<()>,
    },
}

struct CreateOp {
    instance_type: String,
    image_id: String,
    promise: CloudPromise<String>,
}

#[derive(Default)]
struct Queues {
    creates: VecDeque<CreateOp>,
    describes: Vec<(String, CloudPromise<Ec2InstanceInfo>)>,
    describe_alls: Vec<CloudPromise<Vec<Ec2InstanceInfo>>>,
    terminates: Vec<(String, CloudPromise<()>)>,
}

impl Queues {
    fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.describes.is_empty()
            && self.describe_alls.is_empty()
            && self.terminates.is_empty()
    }

    fn push(&mut self, request: Request) {
        match request {
            Request::Create {
                instance_type,
                image_id,
                promise,
            } => self.creates.push_back(CreateOp {
                instance_type,
                image_id,
                promise,
            }),
            Request::Describe {
                instance_id,
                promise,
            } => self.describes.push((instance_id, promise)),
            Request::DescribeAll { promise } => self.describe_alls.push(promise),
            Request::Terminate {
                instance_id,
                promise,
            } => self.terminates.push((instance_id, promise)),
        }
    }

    fn fail_all(self, msg: &str) {
        for op in self.creates {
            op.promise.complete(Err(anyhow::anyhow!("{msg}")));
        }
        for (_, promise) in self.describes {
            promise.complete(Err(anyhow::anyhow!("{msg}")));
        }
        for promise in self.describe_alls {
            promise.complete(Err(anyhow::anyhow!("{msg}")));
        }
        for (_, promise) in self.terminates {
            promise.complete(Err(anyhow::anyhow!("{msg}")));
        }
    }
}

struct Worker {
    settings: Ec2Settings,
    api: Box<dyn Ec2Api>,
    queues: Queues,
    next_call: Instant,
}

impl Worker {
    fn run(mut self, rx: Receiver<Request>) {
        loop {
            let received = if self.queues.is_empty() {
                rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                let now = Instant::now();
                if self.next_call <= now {
                    self.make_call();
                    continue;
                }
                rx.recv_timeout(self.next_call - now)
            };
            match received {
                Ok(request) => self.enqueue(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::trace!("ec2 worker exiting");
        std::mem::take(&mut self.queues).fail_all("Ec2Cloud is shutting down.");
    }

    fn enqueue(&mut self, request: Request) {
        self.queues.push(request);
        self.push_next_call(COALESCE_DELAY_MS);
    }

    fn push_next_call(&mut self, delay_ms: u64) {
        self.next_call = self
            .next_call
            .max(Instant::now() + Duration::from_millis(delay_ms));
    }

    fn make_call(&mut self) {
        if !self.queues.creates.is_empty() {
            self.create_batch();
        } else if !self.queues.describes.is_empty() {
            self.describe_batch();
        } else if !self.queues.describe_alls.is_empty() {
            self.describe_all();
        } else if !self.queues.terminates.is_empty() {
            self.terminate_batch();
        }
        self.push_next_call(CALL_DELAY_MS);
    }

    /// Launch the first queued create together with every other queued create
    /// of the same shape.
    fn create_batch(&mut self) {
        let Some(first) = self.queues.creates.pop_front() else {
            return;
        };
        let (same, rest): (VecDeque<CreateOp>, VecDeque<CreateOp>) =
            std::mem::take(&mut self.queues.creates)
                .into_iter()
                .partition(|op| {
                    op.instance_type == first.instance_type && op.image_id == first.image_id
                });
        self.queues.creates = rest;
        let instance_type = first.instance_type.clone();
        let image_id = first.image_id.clone();
        let mut batch = vec![first];
        batch.extend(same);

        tracing::info!(
            count = batch.len(),
            %instance_type,
            %image_id,
            key_pair = %self.settings.key_pair,
            security_group = %self.settings.security_group,
            "creating ec2 instances"
        );
        let result = if self.settings.key_pair.is_empty() {
            Err(anyhow::anyhow!(
                "You must specify a keypair in order to create a new AWS instance."
            ))
        } else if self.settings.security_group.is_empty() {
            Err(anyhow::anyhow!(
                "You must specify a security group in order to create a new AWS instance."
            ))
        } else {
            self.api
                .run_instances(&instance_type, &image_id, batch.len(), &self.settings)
        };
        match result {
            Ok(ids) => {
                let mut ids = ids.into_iter();
                for op in batch {
                    match ids.next() {
                        Some(id) => op.promise.complete(Ok(id)),
                        None => op
                            .promise
                            .complete(Err(anyhow::anyhow!("Unable to create instance"))),
                    }
                }
            }
            Err(e) => {
                let msg = format!("{e:#}");
                for op in batch {
                    op.promise.complete(Err(anyhow::anyhow!("{msg}")));
                }
            }
        }
    }

    fn describe_batch(&mut self) {
        let mut pending: BTreeMap<String, Vec<CloudPromise<Ec2InstanceInfo>>> = BTreeMap::new();
        for (id, promise) in std::mem::take(&mut self.queues.describes) {
            pending.entry(id).or_default().push(promise);
        }
        let ids: Vec<String> = pending.keys().cloned().collect();
        let failure = match self.api.describe_instances(&ids) {
            Ok(infos) => {
                for info in infos {
                    if let Some(promises) = pending.remove(&info.instance_id) {
                        for promise in promises {
                            promise.complete(Ok(info.clone()));
                        }
                    }
                }
                "Result did not include instanceID.".to_string()
            }
            Err(e) => format!("{e:#}"),
        };
        for promise in pending.into_values().flatten() {
            promise.complete(Err(anyhow::anyhow!("{failure}")));
        }
    }

    fn describe_all(&mut self) {
        let promises = std::mem::take(&mut self.queues.describe_alls);
        let result = if self.settings.key_pair.is_empty() {
            Err(anyhow::anyhow!(
                "You must specify a keypair in order to describe all AWS instances."
            ))
        } else {
            self.api.describe_all(&self.settings.key_pair)
        };
        match result {
            Ok(all) => {
                for promise in promises {
                    promise.complete(Ok(all.clone()));
                }
            }
            Err(e) => {
                let msg = format!("{e:#}");
                for promise in promises {
                    promise.complete(Err(anyhow::anyhow!("{msg}")));
                }
            }
        }
    }

    fn terminate_batch(&mut self) {
        let ops = std::mem::take(&mut self.queues.terminates);
        let mut ids: Vec<String> = ops.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids.dedup();
        match self.api.terminate_instances(&ids) {
            Ok(()) => {
                for (_, promise) in ops {
                    promise.complete(Ok(()));
                }
            }
            Err(e) => {
                let msg = format!("{e:#}");
                for (_, promise) in ops {
                    promise.complete(Err(anyhow::anyhow!("{msg}")));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ec2Cloud
// ---------------------------------------------------------------------------

pub struct Ec2Cloud {
    settings: Ec2Settings,
    sender: Mutex<Option<Sender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    destroy_all_invoked: AtomicBool,
}

impl Ec2Cloud {
    /// Start the worker thread.
    pub fn start(settings: Ec2Settings, api: Box<dyn Ec2Api>) -> Self {
        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            settings: settings.clone(),
            api,
            queues: Queues::default(),
            next_call: Instant::now(),
        };
        let handle = std::thread::Builder::new()
            .name("ec2-cloud".to_string())
            .spawn(move || worker.run(rx));
        let (sender, worker) = match handle {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                tracing::error!("unable to start the ec2 worker thread: {e}");
                (None, None)
            }
        };
        Self {
            settings,
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
            destroy_all_invoked: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &Ec2Settings {
        &self.settings
    }

    fn submit<T>(&self, make: impl FnOnce(CloudPromise<T>) -> Request) -> CloudFuture<T> {
        let (promise, future) = CloudFuture::channel();
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            // A send error drops the request, which completes the future with
            // an abandoned-request error.
            Some(tx) => {
                let _ = tx.send(make(promise));
            }
            None => promise.complete(Err(anyhow::anyhow!("Ec2Cloud is shutting down."))),
        }
        future
    }

    pub fn create_instance(&self, instance_type: &str, image_id: &str) -> CloudFuture<String> {
        self.submit(|promise| Request::Create {
            instance_type: instance_type.to_string(),
            image_id: image_id.to_string(),
            promise,
        })
    }

    pub fn describe_instance(&self, instance_id: &str) -> CloudFuture<Ec2InstanceInfo> {
        self.submit(|promise| Request::Describe {
            instance_id: instance_id.to_string(),
            promise,
        })
    }

    pub fn describe_all_instances(&self) -> CloudFuture<Vec<Ec2InstanceInfo>> {
        self.submit(|promise| Request::DescribeAll { promise })
    }

    pub fn terminate_instance(&self, instance_id: &str) -> CloudFuture<()> {
        self.submit(|promise| Request::Terminate {
            instance_id: instance_id.to_string(),
            promise,
        })
    }

    /// Terminate every castle instance under this key pair. Runs at most once
    /// per cloud.
    pub fn destroy_all(&self, node: &CastleNode) -> anyhow::Result<()> {
        if self.destroy_all_invoked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let infos = self.describe_all_instances().wait()?;
        if infos.is_empty() {
            node.log()
                .info(&format!("*** {}: No EC2 instances found.", node.name()));
            return Ok(());
        }
        let ids: Vec<&str> = infos.iter().map(|i| i.instance_id.as_str()).collect();
        node.log().info(&format!(
            "*** {}: Terminating EC2 instance(s): {}.",
            node.name(),
            ids.join(", ")
        ));
        wait_all(ids.iter().map(|id| self.terminate_instance(id)).collect())?;
        Ok(())
    }
}

impl Cloud for Ec2Cloud {
    /// Stop accepting requests, fail anything still queued, and join the
    /// worker.
    fn close(&self) -> anyhow::Result<()> {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("the ec2 worker thread panicked"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// aws CLI backend
// ---------------------------------------------------------------------------

/// [`Ec2Api`] implemented by shelling out to the `aws` command line tool.
pub struct AwsCliApi {
    region: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<CliInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<CliReservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CliReservation {
    #[serde(default)]
    instances: Vec<CliInstance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CliInstance {
    instance_id: String,
    #[serde(default)]
    private_dns_name: String,
    #[serde(default)]
    public_dns_name: String,
    #[serde(default)]
    state: Option<CliState>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CliState {
    #[serde(default)]
    name: String,
}

impl From<CliInstance> for Ec2InstanceInfo {
    fn from(i: CliInstance) -> Self {
        Ec2InstanceInfo {
            instance_id: i.instance_id,
            private_dns: i.private_dns_name,
            public_dns: i.public_dns_name,
            state: i.state.map(|s| s.name).unwrap_or_default(),
        }
    }
}

impl AwsCliApi {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }

    fn aws(&self, args: &[String]) -> anyhow::Result<String> {
        let binary = which::which("aws")
            .map_err(|e| anyhow::anyhow!("unable to find the aws command line tool: {e}"))?;
        let mut cmd = Command::new(binary);
        cmd.arg("ec2").args(args).args(["--output", "json"]);
        if !self.region.is_empty() {
            cmd.args(["--region", self.region.as_str()]);
        }
        tracing::debug!(args = ?args, "aws ec2");
        let output = cmd.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("aws ec2 {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn parse_reservations(text: &str) -> anyhow::Result<Vec<Ec2InstanceInfo>> {
    let parsed: DescribeInstancesOutput = serde_json::from_str(text)?;
    Ok(parsed
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(Ec2InstanceInfo::from)
        .collect())
}

impl Ec2Api for AwsCliApi {
    fn run_instances(
        &mut self,
        instance_type: &str,
        image_id: &str,
        count: usize,
        settings: &Ec2Settings,
    ) -> anyhow::Result<Vec<String>> {
        let args: Vec<String> = vec![
            "run-instances".into(),
            "--instance-type".into(),
            instance_type.into(),
            "--image-id".into(),
            image_id.into(),
            "--count".into(),
            count.to_string(),
            "--key-name".into(),
            settings.key_pair.clone(),
            "--security-groups".into(),
            settings.security_group.clone(),
            "--tag-specifications".into(),
            format!(
                "ResourceType=instance,Tags=[{{Key={CASTLE_TAG_KEY},Value={CASTLE_TAG_VALUE}}}]"
            ),
        ];
        let parsed: RunInstancesOutput = serde_json::from_str(&self.aws(&args)?)?;
        Ok(parsed.instances.into_iter().map(|i| i.instance_id).collect())
    }

    fn describe_instances(&mut self, ids: &[String]) -> anyhow::Result<Vec<Ec2InstanceInfo>> {
        let mut args = vec!["describe-instances".to_string(), "--instance-ids".to_string()];
        args.extend(ids.iter().cloned());
        parse_reservations(&self.aws(&args)?)
    }

    fn describe_all(&mut self, key_pair: &str) -> anyhow::Result<Vec<Ec2InstanceInfo>> {
        let args = vec![
            "describe-instances".to_string(),
            "--filters".to_string(),
            format!("Name=key-name,Values={key_pair}"),
            format!("Name=tag:{CASTLE_TAG_KEY},Values={CASTLE_TAG_VALUE}"),
        ];
        parse_reservations(&self.aws(&args)?)
    }

    fn terminate_instances(&mut self, ids: &[String]) -> anyhow::Result<()> {
        let mut args = vec![
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
        ];
        args.extend(ids.iter().cloned());
        self.aws(&args)?;
        Ok(())
    }
}

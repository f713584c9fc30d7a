//! Runs the runner image as a one-shot Kubernetes pod.
//!
//! `wait` spawns a [`PodWatch`] task that polls the pod phase and reports
//! changes over a channel. The watch is owned by `wait` and cancelled when
//! it is dropped, so no poller outlives the job.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{Driver, PollPolicy, job_environment, runner_args};
use crate::core::errors::{PodFailedError, WaitTimeoutError};
use crate::core::job::{Job, JobSpec, JobState, metadata_keys};

pub const RUN_ID_LABEL: &str = "run-agent/run-id";
const CONTAINER_NAME: &str = "runner";
const POD_WORKSPACE: &str = "/workspace";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// The slice of the Kubernetes API the driver uses.
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Creates the pod and returns its generated name.
    async fn create_pod(&self, manifest: Value) -> Result<String>;
    async fn pod_phase(&self, name: &str) -> Result<PodPhase>;
    /// Deletes the pod. A pod that is already gone is not an error.
    async fn delete_pod(&self, name: &str) -> Result<()>;
}

/// [`PodApi`] over a kube client scoped to one namespace.
pub struct KubePods {
    api: Api<Pod>,
}

impl KubePods {
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("build kubernetes client")?;
        Ok(Self {
            api: Api::namespaced(client, namespace),
        })
    }
}

#[async_trait]
impl PodApi for KubePods {
    async fn create_pod(&self, manifest: Value) -> Result<String> {
        let pod: Pod = serde_json::from_value(manifest).context("decode pod manifest")?;
        let created = self
            .api
            .create(&PostParams::default(), &pod)
            .await
            .context("create pod")?;
        created
            .metadata
            .name
            .ok_or_else(|| anyhow!("created pod has no name"))
    }

    async fn pod_phase(&self, name: &str) -> Result<PodPhase> {
        let pod = self
            .api
            .get(name)
            .await
            .with_context(|| format!("read pod {name}"))?;
        let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
        Ok(PodPhase::parse(phase))
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete pod {name}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KubernetesOptions {
    pub namespace: String,
    /// Program plus leading arguments inside the image.
    pub command: Vec<String>,
    pub callback_url: String,
    pub poll: PollPolicy,
}

pub struct KubernetesDriver<P> {
    pods: Arc<P>,
    options: KubernetesOptions,
}

impl<P: PodApi + 'static> KubernetesDriver<P> {
    pub fn new(pods: Arc<P>, options: KubernetesOptions) -> Self {
        Self { pods, options }
    }
}

/// Pod manifest for one run attempt.
pub fn pod_manifest(spec: &JobSpec, options: &KubernetesOptions) -> Value {
    let directory = Path::new(POD_WORKSPACE).join(&spec.workspace.working_directory);
    let mut args: Vec<String> = options.command.iter().skip(1).cloned().collect();
    args.extend(runner_args(spec, &directory));
    let command: Vec<&String> = options.command.iter().take(1).collect();
    let env: Vec<Value> = job_environment(spec, &options.callback_url)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "generateName": "run-agent-",
            "namespace": options.namespace,
            "labels": { RUN_ID_LABEL: spec.run.id },
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": CONTAINER_NAME,
                "image": spec.backend_image,
                "imagePullPolicy": spec.image_pull_policy.as_kubernetes(),
                "command": command,
                "args": args,
                "env": env,
                "workingDir": POD_WORKSPACE,
            }],
        },
    })
}

/// Background poller reporting pod phase changes.
///
/// Dropping the watch cancels the task.
pub struct PodWatch {
    updates: mpsc::Receiver<Result<PodPhase>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PodWatch {
    pub fn spawn<P: PodApi + 'static>(pods: Arc<P>, name: String, policy: PollPolicy) -> Self {
        let (tx, updates) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            if !policy.initial_delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(policy.initial_delay) => {}
                }
            }
            let mut last = None;
            loop {
                let update = pods.pod_phase(&name).await;
                let stop = match &update {
                    Ok(phase) => phase.is_terminal(),
                    Err(_) => true,
                };
                let changed = match &update {
                    Ok(phase) => last != Some(*phase),
                    Err(_) => true,
                };
                if changed {
                    if let Ok(phase) = &update {
                        last = Some(*phase);
                    }
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
                if stop {
                    return;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
        });
        Self {
            updates,
            cancel,
            task,
        }
    }

    /// Next phase change. `None` once the watch has stopped.
    pub async fn next(&mut self) -> Option<Result<PodPhase>> {
        self.updates.recv().await
    }
}

impl Drop for PodWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[async_trait]
impl<P: PodApi + 'static> Driver for KubernetesDriver<P> {
    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn start(&self, job: &mut Job) -> Result<()> {
        let manifest = pod_manifest(job.spec(), &self.options);
        let name = self.pods.create_pod(manifest).await?;
        info!(pod = %name, namespace = %self.options.namespace, "pod created");
        job.status.set_metadata(metadata_keys::POD_NAME, name);
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn wait(&self, job: &mut Job) -> Result<()> {
        let name = job
            .status
            .require_metadata(metadata_keys::POD_NAME)?
            .to_string();
        let policy = self.options.poll;
        let deadline = policy.timeout.map(|timeout| Instant::now() + timeout);
        let mut watch = PodWatch::spawn(Arc::clone(&self.pods), name.clone(), policy);

        loop {
            let next = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, watch.next())
                    .await
                    .map_err(|_| WaitTimeoutError {
                        timeout: policy.timeout.unwrap_or_default(),
                    })?,
                None => watch.next().await,
            };
            let phase = next
                .ok_or_else(|| anyhow!("pod watch for {name} ended before the pod finished"))?
                .with_context(|| format!("watch pod {name}"))?;
            debug!(pod = %name, ?phase, "pod phase");

            match phase {
                PodPhase::Pending | PodPhase::Unknown => {}
                PodPhase::Running => job.status.transition(JobState::Running)?,
                PodPhase::Succeeded => {
                    job.status.transition(JobState::Complete)?;
                    return Ok(());
                }
                PodPhase::Failed => {
                    job.status.transition(JobState::Failed)?;
                    return Err(PodFailedError {
                        pod: name,
                        reason: "pod phase Failed".to_string(),
                    }
                    .into());
                }
            }
        }
    }

    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn cleanup(&self, job: &mut Job) -> Result<()> {
        let Some(name) = job.status.get_metadata(metadata_keys::POD_NAME) else {
            debug!("no pod to delete");
            return Ok(());
        };
        self.pods.delete_pod(name).await?;
        info!(pod = %name, "pod deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::core::lifecycle::Operation;
    use crate::driver::drive;
    use crate::test_support::job_spec_fixture;

    #[derive(Default)]
    struct FakePods {
        phases: Mutex<Vec<PodPhase>>,
        probes: AtomicUsize,
        created: Mutex<Vec<Value>>,
        deleted: Mutex<Vec<String>>,
        fail_delete: bool,
    }

    impl FakePods {
        fn with_phases(phases: Vec<PodPhase>) -> Arc<Self> {
            Arc::new(Self {
                phases: Mutex::new(phases),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl PodApi for FakePods {
        async fn create_pod(&self, manifest: Value) -> Result<String> {
            self.created.lock().expect("lock").push(manifest);
            Ok("run-agent-abc12".to_string())
        }

        async fn pod_phase(&self, _name: &str) -> Result<PodPhase> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let mut phases = self.phases.lock().expect("lock");
            if phases.len() > 1 {
                Ok(phases.remove(0))
            } else {
                phases
                    .first()
                    .copied()
                    .ok_or_else(|| anyhow!("pod not found"))
            }
        }

        async fn delete_pod(&self, name: &str) -> Result<()> {
            self.deleted.lock().expect("lock").push(name.to_string());
            if self.fail_delete {
                return Err(anyhow!("delete pod {name}: api server unavailable"));
            }
            Ok(())
        }
    }

    fn options(timeout: Option<Duration>) -> KubernetesOptions {
        KubernetesOptions {
            namespace: "runs".to_string(),
            command: vec!["runner".to_string(), "--verbose".to_string()],
            callback_url: "http://agent.runs.svc:8082".to_string(),
            poll: PollPolicy {
                initial_delay: Duration::ZERO,
                interval: Duration::from_millis(1),
                timeout,
            },
        }
    }

    #[test]
    fn manifest_is_a_one_shot_labelled_pod() {
        let mut spec = job_spec_fixture(Operation::Apply);
        spec.run.is_destroy = true;
        let manifest = pod_manifest(&spec, &options(None));

        assert_eq!(manifest["spec"]["restartPolicy"], "Never");
        assert_eq!(manifest["metadata"]["namespace"], "runs");
        assert_eq!(manifest["metadata"]["labels"][RUN_ID_LABEL], spec.run.id);

        let container = &manifest["spec"]["containers"][0];
        assert_eq!(container["image"], spec.backend_image);
        assert_eq!(container["imagePullPolicy"], "IfNotPresent");
        assert_eq!(container["command"], json!(["runner"]));
        let args = container["args"].as_array().expect("args");
        assert_eq!(args.first(), Some(&json!("--verbose")));
        assert!(args.contains(&json!("--destroy")));
        assert_eq!(args.last(), Some(&json!("destroy")));
        let env = container["env"].as_array().expect("env");
        assert!(env.contains(&json!({"name": "RUN_AGENT_RUN_ID", "value": spec.run.id})));

        let _: Pod = serde_json::from_value(manifest).expect("valid pod");
    }

    #[tokio::test]
    async fn succeeded_pod_completes_the_job_and_is_deleted() {
        let pods = FakePods::with_phases(vec![
            PodPhase::Pending,
            PodPhase::Running,
            PodPhase::Running,
            PodPhase::Succeeded,
        ]);
        let driver = KubernetesDriver::new(Arc::clone(&pods), options(None));
        let mut job = Job::new(job_spec_fixture(Operation::Plan));

        drive(&driver, &mut job).await.expect("drive");

        assert_eq!(
            job.status.history(),
            &[JobState::Pending, JobState::Running, JobState::Complete]
        );
        assert_eq!(
            *pods.deleted.lock().expect("lock"),
            vec!["run-agent-abc12".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_pod_fails_the_job() {
        let pods = FakePods::with_phases(vec![PodPhase::Running, PodPhase::Failed]);
        let driver = KubernetesDriver::new(Arc::clone(&pods), options(None));
        let mut job = Job::new(job_spec_fixture(Operation::Apply));

        let err = drive(&driver, &mut job).await.expect_err("pod failed");
        let failed = err.downcast_ref::<PodFailedError>().expect("pod failed");
        assert_eq!(failed.pod, "run-agent-abc12");
        assert_eq!(job.status.state(), JobState::Failed);
        assert_eq!(pods.deleted.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn wait_times_out_and_stops_the_watch() {
        let pods = FakePods::with_phases(vec![PodPhase::Pending]);
        let driver = KubernetesDriver::new(
            Arc::clone(&pods),
            options(Some(Duration::from_millis(50))),
        );
        let mut job = Job::new(job_spec_fixture(Operation::Plan));

        let err = drive(&driver, &mut job).await.expect_err("timeout");
        assert!(err.downcast_ref::<WaitTimeoutError>().is_some());

        let probes_after_wait = pods.probes.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pods.probes.load(Ordering::SeqCst), probes_after_wait);
    }

    #[tokio::test]
    async fn probe_errors_fail_the_wait() {
        let pods = FakePods::with_phases(Vec::new());
        let driver = KubernetesDriver::new(Arc::clone(&pods), options(None));
        let mut job = Job::new(job_spec_fixture(Operation::Plan));

        let err = drive(&driver, &mut job).await.expect_err("probe error");
        assert!(format!("{err:#}").contains("pod not found"));
        assert_eq!(job.status.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn cleanup_returns_delete_errors_to_the_caller() {
        let pods = Arc::new(FakePods {
            phases: Mutex::new(vec![PodPhase::Succeeded]),
            fail_delete: true,
            ..FakePods::default()
        });
        let driver = KubernetesDriver::new(Arc::clone(&pods), options(None));
        let mut job = Job::new(job_spec_fixture(Operation::Plan));
        driver.start(&mut job).await.expect("start");

        let err = driver.cleanup(&mut job).await.expect_err("delete fails");

        assert_eq!(
            format!("{err:#}"),
            "delete pod run-agent-abc12: api server unavailable"
        );
    }
}

//! mongod commands via pod exec
//!
//! Runs `mongosh`, `mongodump` and `mongorestore` inside the mongod container
//! of a member pod through the Kubernetes exec API. Dumps are streamed back
//! over stdout and restores are fed through stdin.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::controller::backend::{DatabaseShell, MemberRole, ReplicaSetMember, ReplicaSetStatus};
use crate::controller::cluster_state::Member;
use crate::controller::error::{Error, Result};
use crate::resources::common::MONGO_PORT;
use crate::resources::statefulset::MONGO_CONTAINER;

/// Prints the replica set members as JSON, or `initiated: false` before `rs.initiate()`
const RS_STATUS_SCRIPT: &str = r#"
try {
  const s = rs.status();
  print(JSON.stringify({ initiated: true, members: s.members.map(m => ({ name: m.name, state: m.state })) }));
} catch (e) {
  if (e.code === 94) {
    print(JSON.stringify({ initiated: false, members: [] }));
  } else {
    throw e;
  }
}
"#;

#[derive(Deserialize)]
struct RsStatusOutput {
    initiated: bool,
    members: Vec<RsMemberOutput>,
}

#[derive(Deserialize)]
struct RsMemberOutput {
    name: String,
    state: i64,
}

/// Parse the output of `RS_STATUS_SCRIPT`
pub fn parse_rs_status(output: &str) -> Result<ReplicaSetStatus> {
    // mongosh may print warnings before the payload; the payload is the last line
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .ok_or_else(|| {
            Error::TransientInfraError(format!("unexpected rs.status() output: {}", output.trim()))
        })?;
    let parsed: RsStatusOutput = serde_json::from_str(line)?;

    Ok(ReplicaSetStatus {
        initiated: parsed.initiated,
        members: parsed
            .members
            .into_iter()
            .map(|m| ReplicaSetMember {
                host: m.name,
                role: MemberRole::from_state(m.state),
            })
            .collect(),
    })
}

fn local_host() -> String {
    format!("localhost:{}", MONGO_PORT)
}

/// Database shell backed by `kubectl exec`-style pod exec
#[derive(Clone)]
pub struct KubeMongoShell {
    client: Client,
}

impl KubeMongoShell {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
        input: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let program = command.first().cloned().unwrap_or_default();
        let params = AttachParams {
            container: Some(MONGO_CONTAINER.to_string()),
            stdin: input.is_some(),
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        debug!(pod = %pod, program = %program, "exec in member");
        let mut attached = pods.exec(pod, command, &params).await?;

        let stdin = attached.stdin();
        let stdout = attached
            .stdout()
            .ok_or_else(|| Error::TransientInfraError("exec produced no stdout".to_string()))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| Error::TransientInfraError("exec produced no stderr".to_string()))?;
        let status = attached
            .take_status()
            .ok_or_else(|| Error::TransientInfraError("exec produced no status".to_string()))?;

        let write = async move {
            if let (Some(mut writer), Some(data)) = (stdin, input) {
                writer.write_all(&data).await?;
                writer.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        // stdout and stderr are drained together so neither can stall the other
        let (written, out, err) = tokio::join!(write, read_all(stdout), read_all(stderr));
        let exec_io = |e: std::io::Error| {
            Error::TransientInfraError(format!("{} in {}: {}", program, pod, e))
        };
        written.map_err(exec_io)?;
        let out = out.map_err(exec_io)?;
        let err = err.map_err(exec_io)?;

        if let Some(status) = status.await
            && status.status.as_deref() != Some("Success")
        {
            let stderr = String::from_utf8_lossy(&err);
            let detail = match stderr.trim() {
                "" => status.message.unwrap_or_default(),
                text => text.to_string(),
            };
            return Err(Error::TransientInfraError(format!(
                "{} failed in {}: {}",
                program, pod, detail
            )));
        }

        Ok(out)
    }

    async fn eval(&self, namespace: &str, member: &Member, script: &str) -> Result<String> {
        let command = vec![
            "mongosh".to_string(),
            "--quiet".to_string(),
            "--host".to_string(),
            local_host(),
            "--eval".to_string(),
            script.to_string(),
        ];
        let out = self.exec(namespace, &member.name, command, None).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(buffer)
}

#[async_trait]
impl DatabaseShell for KubeMongoShell {
    async fn dump(&self, namespace: &str, member: &Member) -> Result<Vec<u8>> {
        let command = vec![
            "mongodump".to_string(),
            "--quiet".to_string(),
            "--host".to_string(),
            local_host(),
            "--oplog".to_string(),
            "--archive".to_string(),
        ];
        self.exec(namespace, &member.name, command, None).await
    }

    async fn restore(&self, namespace: &str, member: &Member, archive: Vec<u8>) -> Result<()> {
        let command = vec![
            "mongorestore".to_string(),
            "--quiet".to_string(),
            "--host".to_string(),
            local_host(),
            "--drop".to_string(),
            "--oplogReplay".to_string(),
            "--archive".to_string(),
        ];
        self.exec(namespace, &member.name, command, Some(archive))
            .await?;
        Ok(())
    }

    async fn replica_set_status(
        &self,
        namespace: &str,
        member: &Member,
    ) -> Result<ReplicaSetStatus> {
        let output = self.eval(namespace, member, RS_STATUS_SCRIPT).await?;
        parse_rs_status(&output)
    }

    async fn initiate(
        &self,
        namespace: &str,
        member: &Member,
        set_name: &str,
        hosts: &[String],
    ) -> Result<()> {
        let config = json!({
            "_id": set_name,
            "members": hosts
                .iter()
                .enumerate()
                .map(|(id, host)| json!({ "_id": id, "host": host }))
                .collect::<Vec<_>>(),
        });
        self.eval(namespace, member, &format!("rs.initiate({})", config))
            .await?;
        Ok(())
    }

    async fn add_host(&self, namespace: &str, primary: &Member, host: &str) -> Result<()> {
        let script = format!("rs.add({})", serde_json::to_string(host)?);
        self.eval(namespace, primary, &script).await?;
        Ok(())
    }

    async fn remove_host(&self, namespace: &str, primary: &Member, host: &str) -> Result<()> {
        let script = format!("rs.remove({})", serde_json::to_string(host)?);
        self.eval(namespace, primary, &script).await?;
        Ok(())
    }

    async fn step_down(&self, namespace: &str, primary: &Member) -> Result<()> {
        // The primary may drop the shell connection while stepping down
        let script = "try { rs.stepDown(60) } catch (e) { if (!/network|connection/i.test(String(e))) throw e }";
        self.eval(namespace, primary, script).await?;
        Ok(())
    }

    async fn ensure_user(
        &self,
        namespace: &str,
        primary: &Member,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let script = format!(
            "const admin = db.getSiblingDB('admin'); if (!admin.getUser({user})) {{ admin.createUser({{ user: {user}, pwd: {pwd}, roles: ['root'] }}) }}",
            user = serde_json::to_string(username)?,
            pwd = serde_json::to_string(password)?,
        );
        self.eval(namespace, primary, &script).await?;
        Ok(())
    }
}

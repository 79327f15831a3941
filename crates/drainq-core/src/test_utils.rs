use crate::sqs::SqsClient;
use aws_sdk_sqs::config::Credentials;
use testcontainers::ContainerAsync;
use testcontainers_modules::{
    localstack::LocalStack,
    testcontainers::{runners::AsyncRunner, Image, ImageExt, TestcontainersError},
};
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, OnceCell};

pub fn local_config(endpoint_url: &str, region: Option<&'static str>) -> aws_config::ConfigLoader {
    aws_config::defaults(aws_config::BehaviorVersion::latest())
        .endpoint_url(endpoint_url)
        .region(region.unwrap_or("us-east-1"))
        .credentials_provider(Credentials::new("test", "test", None, None, "static"))
}

pub async fn localstack() -> Result<(String, ContainerAsync<LocalStack>), TestcontainersError> {
    let request = LocalStack::default()
        .with_tag("latest")
        .with_env_var("SERVICES", "sqs")
        .with_env_var("SKIP_SSL_CERT_DOWNLOAD", "1");
    let container = request.start().await?;

    let host_ip = container.get_host().await?;
    let host_port = container.get_host_port_ipv4(4566).await?;
    let endpoint_url = format!("http://{host_ip}:{host_port}");

    Ok((endpoint_url, container))
}

pub async fn create_test_queue<I: Image>(
    container: &ContainerAsync<I>,
    name: &str,
    debug: bool,
) -> Result<(), TestcontainersError> {
    let create_queue_command = testcontainers::core::ExecCommand::new([
        "awslocal",
        "sqs",
        "create-queue",
        "--queue-name",
        name,
    ])
    .with_container_ready_conditions(vec![testcontainers::core::WaitFor::message_on_stdout(
        "AWS sqs.CreateQueue => 200",
    )]);

    let mut output = container.exec(create_queue_command).await?;

    if debug {
        let mut stdout = String::new();
        let mut stderr = String::new();
        output.stdout().read_to_string(&mut stdout).await.unwrap();
        output.stderr().read_to_string(&mut stderr).await.unwrap();
        println!(
            "Queue creation command output:\nstdout: {}\nstderr: {}",
            stdout, stderr
        );
    }

    Ok(())
}

// One LocalStack container shared by every test in the process
static SHARED_CONTAINER: OnceCell<Mutex<(String, ContainerAsync<LocalStack>)>> =
    OnceCell::const_new();

pub async fn shared_localstack() -> &'static Mutex<(String, ContainerAsync<LocalStack>)> {
    SHARED_CONTAINER
        .get_or_init(|| async {
            let (endpoint_url, container) = localstack().await.unwrap();
            Mutex::new((endpoint_url, container))
        })
        .await
}

/// Queue name unique to this process and call.
pub fn unique_queue_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "{}-{}-{}",
        prefix,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Creates a fresh queue on the shared container and returns a connected
/// client together with the queue URL.
///
/// Retries resolving the queue URL to handle eventual consistency.
pub async fn setup(name: &str) -> (SqsClient, String) {
    let container = shared_localstack().await;
    let queue_name = unique_queue_name(name);

    let endpoint_url = {
        let guard = container.lock().await;
        create_test_queue(&guard.1, &queue_name, false)
            .await
            .unwrap();
        guard.0.clone()
    };

    let client = SqsClient::connect(local_config(&endpoint_url, None).load().await);

    let queue_url = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if let Ok(url) = client.queue_url(&queue_name).await {
                return url;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("Timeout waiting for queue to be available");

    (client, queue_url)
}

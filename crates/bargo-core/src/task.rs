use std::future::Future;

use tokio::task::JoinHandle;

/// Spawn a handler task with a supervisor that reports its panic.
///
/// A panicking handler only takes down its own task; the supervisor turns
/// the otherwise-silent `JoinError` into a log line. Expected errors are the
/// handler's own business and should be logged before it returns.
pub fn spawn_logged<F>(name: &'static str, future: F) -> JoinHandle<()>
where
	F: Future<Output = ()> + Send + 'static,
{
	let handle = tokio::spawn(future);
	tokio::spawn(async move {
		if let Err(err) = handle.await {
			if err.is_panic() {
				crate::error!(target: "[TASK]", "{name} task panicked: {err}");
			}
		}
	})
}

#[cfg(test)]
mod tests {
	use super::spawn_logged;

	#[tokio::test]
	async fn supervisor_outlives_a_panicking_task() {
		let supervisor = spawn_logged("test", async {
			panic!("boom");
		});
		// the supervisor itself finishes cleanly after logging
		supervisor.await.unwrap();
	}

	#[tokio::test]
	async fn clean_exit_is_silent() {
		spawn_logged("test", async {}).await.unwrap();
	}
}

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};

/// Fire-and-forget Kubernetes events about the operator instance.
pub(crate) trait EventRecorder: Send + Sync {
    fn event(&self, type_: EventType, reason: &str, message: String);

    fn record(&self, reason: &str, message: String) {
        self.event(EventType::Normal, reason, message)
    }

    fn warning(&self, reason: &str, message: String) {
        self.event(EventType::Warning, reason, message)
    }
}

const ACTION: &'static str = "Reconcile";

pub(crate) struct KubeEventRecorder {
    recorder: Recorder,
    reference: ObjectReference,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str, reference: ObjectReference) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            reference,
        }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn event(&self, type_: EventType, reason: &str, message: String) {
        let recorder = self.recorder.clone();
        let reference = self.reference.clone();
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: ACTION.to_string(),
            secondary: None,
        };
        tokio::spawn(async move {
            if let Err(e) = recorder.publish(&event, &reference).await {
                warn!("failed to publish event {}: {}", event.reason, e);
            }
        });
    }
}

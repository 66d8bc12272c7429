//! Typed per-method stubs over [`RpcClient`](crate::client::RpcClient).
//!
//! Each stub fixes the service/method pair and the payload types so call
//! sites never touch raw method keys or bytes.

use serde::{Deserialize, Serialize};

/// Defines a stub struct whose methods each pin one `service/method` pair
/// and its request/response types to the underlying [`RpcClient`].
///
/// ```ignore
/// service_stub! {
///     pub struct AgentClient;
///     fn ping("demo.Agent" / "Ping"): () => ActionOutcome;
/// }
/// ```
#[macro_export]
macro_rules! service_stub {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident;
        $(
            $(#[$fn_meta:meta])*
            fn $fn_name:ident($service:literal / $method:literal): $req:ty => $resp:ty;
        )+
    ) => {
        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $name {
            rpc: $crate::client::RpcClient,
        }

        impl $name {
            $vis fn new(rpc: $crate::client::RpcClient) -> Self {
                Self { rpc }
            }

            $(
                $(#[$fn_meta])*
                $vis async fn $fn_name(
                    &self,
                    request: &$req,
                ) -> Result<$resp, $crate::errors::CallError> {
                    let key = $crate::codec::MethodKey::new($service, $method);
                    self.rpc.call(&key, request).await
                }
            )+
        }
    };
}

/// One piece of user input forwarded to the agent for evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputReport {
    pub request_id: String,
    pub input_type: UserInputType,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserInputType {
    Speech,
    Text,
    Choice,
}

/// Client-side request to change the running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionControl {
    pub request_id: String,
    pub op: SessionOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOp {
    Pause,
    Resume,
    End,
}

service_stub! {
    /// Client-initiated calls into the agent's interaction service.
    pub struct AgentInteractionClient;

    /// Forwards user input (speech transcript, typed text, or a multiple
    /// choice pick) for the agent to evaluate.
    fn submit_user_input("rox.interaction.AgentInterface" / "SubmitUserInput"):
        UserInputReport => crate::registry::ActionOutcome;

    fn control_session("rox.interaction.AgentInterface" / "ControlSession"):
        SessionControl => crate::registry::ActionOutcome;
}

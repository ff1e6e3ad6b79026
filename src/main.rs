use std::sync::Arc;

use casequeue::transport::{sqs::SqsTransport, Transport};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    casequeue::run()
        .transport_factory(|config| async move {
            SqsTransport::from_config(&config)
                .await
                .map(|transport| Arc::new(transport) as Arc<dyn Transport>)
        })
        .start()
        .await
}

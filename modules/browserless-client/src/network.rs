use std::collections::HashMap;
use std::sync::Arc;

use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::page::BrowserPage;

const RESPONSE_BUFFER: usize = 256;

/// A finished response body captured from the page's own traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedResponse {
    pub url: String,
    pub body: String,
    pub is_base64: bool,
}

enum Observed {
    Response(Arc<EventResponseReceived>),
    Finished(Arc<EventLoadingFinished>),
}

impl BrowserPage {
    /// Stream bodies of responses whose URL passes `filter`.
    ///
    /// Bodies are read once loading finishes. The capture task ends when the
    /// receiver is dropped or the page goes away.
    pub async fn observe_responses<F>(&self, filter: F) -> Result<mpsc::Receiver<CapturedResponse>>
    where
        F: Fn(&str) -> bool + Send + 'static,
    {
        let page = self.inner().clone();
        page.execute(EnableParams::default()).await?;

        let responses = page
            .event_listener::<EventResponseReceived>()
            .await?
            .map(Observed::Response);
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await?
            .map(Observed::Finished);
        let mut events = futures::stream::select(responses, finished);

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        tokio::spawn(async move {
            let mut in_flight: HashMap<String, String> = HashMap::new();
            while let Some(event) = events.next().await {
                match event {
                    Observed::Response(event) => {
                        if filter(&event.response.url) {
                            in_flight.insert(
                                event.request_id.inner().clone(),
                                event.response.url.clone(),
                            );
                        }
                    }
                    Observed::Finished(event) => {
                        let Some(url) = in_flight.remove(event.request_id.inner()) else {
                            continue;
                        };
                        let params = GetResponseBodyParams::new(event.request_id.clone());
                        match page.execute(params).await {
                            Ok(resp) => {
                                let captured = CapturedResponse {
                                    url,
                                    body: resp.result.body.clone(),
                                    is_base64: resp.result.base64_encoded,
                                };
                                if tx.send(captured).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => debug!(url = url.as_str(), error = %err, "Response body unavailable"),
                        }
                    }
                }
            }
            debug!("Network capture stopped");
        });

        Ok(rx)
    }
}

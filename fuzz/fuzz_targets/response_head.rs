#![no_main]

use libfuzzer_sys::fuzz_target;

use relaycache::proxy::http::codec::{ResponseHeadCollector, parse_response_head};

fuzz_target!(|data: &[u8]| {
    let whole = parse_response_head(data).ok();

    // Feeding the same bytes in pieces must not change the outcome.
    let split = data.first().map(|b| *b as usize % (data.len() + 1)).unwrap_or(0);
    let mut collector = ResponseHeadCollector::new(data.len().max(1));
    let _ = collector.feed(&data[..split]);
    let _ = collector.feed(&data[split..]);
    if let (Some(whole), Some(pieced)) = (whole.as_ref(), collector.head()) {
        assert_eq!(whole.status, pieced.status);
    }
});

#![no_main]

use libfuzzer_sys::fuzz_target;

use relaycache::proxy::cache::cache_key;
use relaycache::proxy::http::codec::parse_request;

fuzz_target!(|data: &[u8]| {
    let Ok(mut request) = parse_request(data) else {
        return;
    };
    let _ = request.host_port();
    let _ = cache_key(&request.url);
    request.prepare_for_origin();
    if let Ok(reparsed) = parse_request(&request.to_bytes()) {
        assert_eq!(reparsed.method, request.method);
        assert_eq!(reparsed.url, request.url);
    }
});

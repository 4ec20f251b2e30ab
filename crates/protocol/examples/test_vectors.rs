//! Generate wire vectors for browser-side interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::{encode_signal, Fragmenter, FrameUnit, MessageId, SignalKind};

fn main() {
    // Vector 1: unfragmented offer
    let offer = encode_signal(SignalKind::Offer, br#"{"type":"offer","sdp":"v=0"}"#);
    print_vector("offer_whole", &[offer]);

    // Vector 2: answer split into 16-byte chunks
    let answer = encode_signal(SignalKind::Answer, br#"{"type":"answer","sdp":"v=0"}"#);
    let fragments = Fragmenter::new(16)
        .expect("non-zero chunk size")
        .split(&MessageId::new("4242"), &answer);
    let datagrams: Vec<Vec<u8>> = fragments.iter().map(|f| f.encode()).collect();
    print_vector("answer_fragments", &datagrams);

    // Vector 3: single-message frame
    let frame = FrameUnit::new(&b"\xff\xd8\xff\xe0jpeg"[..], 640, 360);
    let whole = frame.to_message().expect("serializable frame");
    print_vector("frame_whole", &[whole.into_bytes()]);

    // Vector 4: chunked frame
    let chunked = frame
        .to_chunked_messages(1, 4)
        .expect("serializable frame");
    let chunked: Vec<Vec<u8>> = chunked.into_iter().map(String::into_bytes).collect();
    print_vector("frame_chunked", &chunked);
}

fn print_vector(name: &str, datagrams: &[Vec<u8>]) {
    println!("=== {} ===", name);
    for datagram in datagrams {
        println!("{}", String::from_utf8_lossy(datagram));
    }
    println!();
}

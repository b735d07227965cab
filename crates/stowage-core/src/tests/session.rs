use stowage_protocol::ServerMessage;
use stowage_types::{ErrorClass, SavePath, StowageError};
use walkdir::WalkDir;

use crate::config::Phase2Config;
use crate::driver::Phase2Session;
use crate::manifest::{list_segments, segment_name, FileHeader, Record};
use crate::stats::SessionReport;
use crate::store::BlockStore;
use crate::testutil::{
    directory, file, read_manifest, sig_of, write_manifest, FakeChamp, FakeClient, ScriptedPeers,
    SessionFixture,
};

fn run(fx: &SessionFixture, config: Phase2Config, peers: &mut ScriptedPeers) -> SessionReport {
    Phase2Session::open(&fx.dirs, config)
        .unwrap()
        .run(peers)
        .unwrap()
}

fn sig(data: &[u8], save_path: SavePath) -> Record {
    Record::Sig {
        signature: sig_of(data),
        save_path,
    }
}

fn headers(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match r {
            Record::Header(FileHeader { path, .. }) => Some(path.clone()),
            _ => None,
        })
        .collect()
}

fn save_paths(records: &[Record]) -> Vec<SavePath> {
    records
        .iter()
        .filter_map(|r| match r {
            Record::Sig { save_path, .. } => Some(*save_path),
            _ => None,
        })
        .collect()
}

fn lock_files(fx: &SessionFixture) -> Vec<std::path::PathBuf> {
    WalkDir::new(&fx.dirs.data)
        .into_iter()
        .map(|e| e.unwrap().into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "lock"))
        .collect()
}

fn announced_paths(client: &FakeClient) -> Vec<String> {
    client
        .received
        .iter()
        .filter_map(|m| match m {
            ServerMessage::Path(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn only_unknown_blocks_are_fetched() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/f", 5)]);
    let mut client = FakeClient::new();
    client.add_file("/f", 5, &[b"P0", b"P1", b"P2"]);
    let mut champ = FakeChamp::new();
    let p0 = SavePath::new(0x10, 0, 0, 0);
    let p2 = SavePath::new(0x10, 0, 0, 1);
    champ.knows(b"P0", p0);
    champ.knows(b"P2", p2);
    let mut peers = ScriptedPeers::new(client, champ);

    let report = run(&fx, Phase2Config::default(), &mut peers);

    assert_eq!(peers.client.data_requests, vec![1]);
    let fetched = SavePath::new(0, 0, 0, 0);
    let records = read_manifest(&fx.dirs.changed());
    assert_eq!(records.len(), 5);
    let Record::Header(header) = &records[0] else {
        panic!("manifest starts with {:?}", records[0]);
    };
    assert_eq!(header.path, "/f");
    // Attributes come from the client, not the scan.
    assert_eq!(header.attribs.size, 6);
    assert_eq!(
        records[1..],
        [sig(b"P0", p0), sig(b"P1", fetched), sig(b"P2", p2), Record::EndFile]
    );

    let stats = &report.stats;
    assert_eq!(stats.entries_new, 1);
    assert_eq!(stats.files_announced, 1);
    assert_eq!(stats.blocks_total, 3);
    assert_eq!(stats.blocks_deduplicated, 2);
    assert_eq!(stats.blocks_fetched, 1);
    assert_eq!(stats.data_requests, 1);
    assert_eq!(stats.bytes_received, 2);
    assert_eq!(stats.sigs_sent, 3);
    assert!(peers.champ.sigs_end);

    let store = BlockStore::open(&fx.dirs.data, &Phase2Config::default()).unwrap();
    assert_eq!(store.read_block(&fetched).unwrap().as_deref(), Some(&b"P1"[..]));
    assert!(!fx.dirs.data.join("0000/0000/0000.lock").exists());
}

#[test]
fn one_late_miss_resolves_every_earlier_block() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/f", 5)]);
    let mut client = FakeClient::new();
    client.add_file("/f", 5, &[b"m0", b"m1", b"m2"]);
    let mut champ = FakeChamp::new();
    champ.lazy_misses = true;
    let mut peers = ScriptedPeers::new(client, champ);

    let report = run(&fx, Phase2Config::default(), &mut peers);

    assert_eq!(peers.client.data_requests, vec![0, 1, 2]);
    assert_eq!(report.stats.blocks_deduplicated, 0);
    assert_eq!(
        save_paths(&read_manifest(&fx.dirs.changed())),
        (0..3).map(|s| SavePath::new(0, 0, 0, s)).collect::<Vec<_>>()
    );
}

#[test]
fn found_verdict_implies_earlier_misses() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/f", 5)]);
    let mut client = FakeClient::new();
    client.add_file("/f", 5, &[b"m0", b"m1", b"k2"]);
    let mut champ = FakeChamp::new();
    champ.lazy_misses = true;
    champ.knows(b"k2", SavePath::new(9, 9, 9, 9));
    let mut peers = ScriptedPeers::new(client, champ);

    run(&fx, Phase2Config::default(), &mut peers);

    assert_eq!(peers.client.data_requests, vec![0, 1]);
    assert_eq!(
        save_paths(&read_manifest(&fx.dirs.changed())),
        vec![
            SavePath::new(0, 0, 0, 0),
            SavePath::new(0, 0, 0, 1),
            SavePath::new(9, 9, 9, 9)
        ]
    );
}

#[test]
fn blocked_channels_only_delay_the_session() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[
        file("/a", 1),
        file("/b", 1),
        file("/c", 1),
        directory("/d", 1),
        file("/e", 1),
    ]);
    let mut client = FakeClient::new();
    client.add_file("/a", 1, &[b"a0", b"a1"]);
    client.add_file("/b", 1, &[b"b0"]);
    client.add_file("/c", 1, &[]);
    client.add_file("/e", 1, &[b"e0", b"e1", b"e2"]);
    let mut champ = FakeChamp::new();
    champ.knows(b"b0", SavePath::new(1, 0, 0, 0));
    let mut peers = ScriptedPeers::new(client, champ);
    peers.client_capacity = Some(1);
    peers.champ_capacity = Some(1);

    run(&fx, Phase2Config::default(), &mut peers);

    assert!(peers.blocked_appends > 0);
    assert_eq!(peers.client.data_requests, vec![0, 1, 3, 4, 5]);
    let records = read_manifest(&fx.dirs.changed());
    assert_eq!(headers(&records), ["/a", "/b", "/c", "/d", "/e"]);
    // The empty file still gets its end marker; the directory does not.
    let c = records
        .iter()
        .position(|r| matches!(r, Record::Header(h) if h.path == "/c"))
        .unwrap();
    assert_eq!(records[c + 1], Record::EndFile);
    assert!(matches!(&records[c + 2], Record::Header(h) if h.path == "/d"));
    assert!(matches!(&records[c + 3], Record::Header(h) if h.path == "/e"));
}

#[test]
fn small_window_still_drains_runs_of_directories() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[
        file("/a", 1),
        directory("/b", 1),
        directory("/c", 1),
        directory("/d", 1),
        file("/e", 1),
        file("/f", 1),
    ]);
    let mut client = FakeClient::new();
    for path in ["/a", "/e", "/f"] {
        client.add_file(path, 1, &[path.as_bytes()]);
    }
    let mut peers = ScriptedPeers::new(client, FakeChamp::new());
    let config = Phase2Config {
        queue_window: 2,
        ..Phase2Config::default()
    };

    let report = run(&fx, config, &mut peers);

    assert_eq!(
        headers(&read_manifest(&fx.dirs.changed())),
        ["/a", "/b", "/c", "/d", "/e", "/f"]
    );
    assert_eq!(report.stats.blocks_fetched, 3);
}

#[test]
fn unchanged_entries_reuse_the_previous_backup() {
    let fx = SessionFixture::new();
    let kept = SavePath::new(0, 0, 0, 0);
    fx.write_current(&[
        Record::Header(file("/a", 10)),
        sig(b"A", kept),
        Record::EndFile,
        Record::Header(file("/b", 10)),
        sig(b"B-old", SavePath::new(0, 0, 0, 1)),
        Record::EndFile,
        Record::Header(file("/gone", 10)),
        Record::EndFile,
    ]);
    fx.write_phase1(&[file("/a", 10), file("/b", 11), file("/c", 1)]);
    let mut client = FakeClient::new();
    client.add_file("/b", 11, &[b"B-new"]);
    client.add_file("/c", 1, &[b"C"]);
    let mut peers = ScriptedPeers::new(client, FakeChamp::new());

    let report = run(&fx, Phase2Config::default(), &mut peers);

    assert_eq!(announced_paths(&peers.client), ["/b", "/c"]);
    assert_eq!(
        read_manifest(&fx.dirs.unchanged()),
        vec![Record::Header(file("/a", 10)), sig(b"A", kept), Record::EndFile]
    );
    assert_eq!(headers(&read_manifest(&fx.dirs.changed())), ["/b", "/c"]);
    assert_eq!(report.stats.entries_unchanged, 1);
    assert_eq!(report.stats.entries_changed, 1);
    assert_eq!(report.stats.entries_new, 1);
}

#[test]
fn files_the_client_skips_are_left_out() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/a", 1), file("/b", 1), file("/c", 1), file("/z", 1)]);
    let mut client = FakeClient::new();
    for path in ["/a", "/b", "/c", "/z"] {
        client.add_file(path, 1, &[path.as_bytes()]);
    }
    client.vanish("/b");
    client.vanish("/z");
    let mut peers = ScriptedPeers::new(client, FakeChamp::new());

    let report = run(&fx, Phase2Config::default(), &mut peers);

    assert_eq!(headers(&read_manifest(&fx.dirs.changed())), ["/a", "/c"]);
    assert_eq!(report.stats.entries_abandoned, 2);
    assert_eq!(peers.client.data_requests, vec![0, 1]);
}

#[test]
fn completed_segments_are_offered_for_dedup() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/f", 1)]);
    let mut client = FakeClient::new();
    client.add_file("/f", 1, &[b"k0", b"k1", b"k2"]);
    let mut champ = FakeChamp::new();
    for (slot, data) in [b"k0", b"k1", b"k2"].into_iter().enumerate() {
        champ.knows(data, SavePath::new(2, 0, 0, slot as u16));
    }
    let mut peers = ScriptedPeers::new(client, champ);
    let config = Phase2Config {
        sigs_per_manifest_segment: 2,
        ..Phase2Config::default()
    };

    run(&fx, config, &mut peers);

    assert!(peers.client.data_requests.is_empty());
    assert_eq!(peers.champ.manifests.len(), 1);
    assert!(peers.champ.manifests[0].ends_with(&segment_name(0)));
    // Block 1 closed the segment and was never requested.
    assert_eq!(peers.client.wrap_ups, vec![1]);
    assert_eq!(list_segments(&fx.dirs.changed()).unwrap().len(), 2);
}

#[test]
fn client_ending_before_block_requests_is_a_protocol_error() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/f", 1)]);
    let mut client = FakeClient::new();
    client.add_file("/f", 1, &[b"x"]);
    client.end_early = true;
    let mut peers = ScriptedPeers::new(client, FakeChamp::new());

    let err = Phase2Session::open(&fx.dirs, Phase2Config::default())
        .unwrap()
        .run(&mut peers)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Protocol);
}

#[test]
fn interrupted_session_resumes_after_the_last_committed_entry() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/a", 1), file("/b", 1), file("/c", 1)]);
    let old = SavePath::new(0, 0, 0, 0);
    write_manifest(
        &fx.dirs.changed(),
        4096,
        &[
            Record::Header(file("/a", 1)),
            sig(b"A", old),
            Record::EndFile,
            Record::Header(file("/b", 1)),
        ],
    );
    // The crash left the data file it was filling locked.
    let data_dir = fx.dirs.data.join("0000/0000");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(data_dir.join("0000"), b"").unwrap();
    std::fs::write(data_dir.join("0000.lock"), b"").unwrap();

    let mut client = FakeClient::new();
    client.add_file("/b", 1, &[b"B"]);
    client.add_file("/c", 1, &[b"C"]);
    let mut peers = ScriptedPeers::new(client, FakeChamp::new());

    let report = run(&fx, Phase2Config::default(), &mut peers);

    assert_eq!(announced_paths(&peers.client), ["/b", "/c"]);
    let records = read_manifest(&fx.dirs.changed());
    assert_eq!(headers(&records), ["/a", "/b", "/c"]);
    assert_eq!(
        save_paths(&records),
        vec![old, SavePath::new(0, 0, 1, 0), SavePath::new(0, 0, 1, 1)]
    );
    assert_eq!(report.stats.entries_new, 2);
    assert!(!data_dir.join("0000.lock").exists());
}

#[test]
fn queue_span_stays_within_the_window() {
    let fx = SessionFixture::new();
    let paths: Vec<String> = (0..8).map(|i| format!("/f{i}")).collect();
    let scan: Vec<FileHeader> = paths.iter().map(|p| file(p, 1)).collect();
    fx.write_phase1(&scan);
    let mut client = FakeClient::new();
    for path in &paths {
        client.add_file(path, 1, &[path.as_bytes()]);
    }
    let mut peers = ScriptedPeers::new(client, FakeChamp::new());
    let window = 3;
    let config = Phase2Config {
        queue_window: window,
        ..Phase2Config::default()
    };

    let mut seen = Vec::new();
    let stats = Phase2Session::open(&fx.dirs, config)
        .unwrap()
        .run_observed(&mut peers, |session| {
            seen.push((session.queue_span(), session.entries_scanned()))
        })
        .unwrap();

    // Scanning stops at the window with files still to go.
    assert_eq!(seen[0], (window, window));
    // Every entry carries data, so the overflow is at most one file.
    assert!(
        seen.iter().all(|&(span, _)| span <= window + 1),
        "spans {seen:?}"
    );
    assert_eq!(seen.last().map(|&(_, scanned)| scanned), Some(8));
    assert_eq!(stats.blocks_fetched, 8);
    assert_eq!(headers(&read_manifest(&fx.dirs.changed())), paths);
}

#[test]
fn attributes_for_a_skipped_file_are_a_protocol_error() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/a", 1), file("/b", 1)]);
    let mut client = FakeClient::new();
    client.add_file("/a", 1, &[b"a"]);
    client.add_file("/b", 1, &[b"b"]);
    client.vanish("/a");
    client.resend_skipped = true;
    let mut peers = ScriptedPeers::new(client, FakeChamp::new());

    let err = Phase2Session::open(&fx.dirs, Phase2Config::default())
        .unwrap()
        .run(&mut peers)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Protocol, "{err}");
}

#[test]
fn aborted_session_releases_its_data_files_and_resumes() {
    let fx = SessionFixture::new();
    fx.write_phase1(&[file("/f", 1)]);
    let config = Phase2Config {
        blocks_per_data_file: 1,
        ..Phase2Config::default()
    };
    let client_with_file = || {
        let mut client = FakeClient::new();
        client.add_file("/f", 1, &[b"x0", b"x1"]);
        client
    };

    // Both misses reserve a data file before the first request goes out.
    let mut peers = ScriptedPeers::new(client_with_file(), FakeChamp::new());
    peers.reset_after_data_requests = Some(1);
    let err = Phase2Session::open(&fx.dirs, config.clone())
        .unwrap()
        .run(&mut peers)
        .unwrap_err();
    assert!(matches!(err, StowageError::Channel(_)), "{err}");
    assert_eq!(peers.client.data_requests, vec![0]);
    assert!(fx.dirs.data.join("0000/0000/0001").exists());
    assert_eq!(lock_files(&fx), Vec::<std::path::PathBuf>::new());

    let mut peers = ScriptedPeers::new(client_with_file(), FakeChamp::new());
    run(&fx, config, &mut peers);

    assert_eq!(announced_paths(&peers.client), ["/f"]);
    assert_eq!(
        save_paths(&read_manifest(&fx.dirs.changed())),
        vec![SavePath::new(0, 0, 2, 0), SavePath::new(0, 0, 3, 0)]
    );
    assert!(lock_files(&fx).is_empty());
}

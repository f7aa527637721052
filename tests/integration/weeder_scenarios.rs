#![allow(missing_docs)]

//! End-to-end weeder scenarios against an in-process cache and
//! repository.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use poda::graphlog::{Node, Root};
use poda::repos::{LocalRepository, Repository};
use poda::shortid::{self, LeaseConfig};
use poda::weeder::stable::{self, MiscVars, StablePaths};
use poda::weeder::{DeletionStatus, WeedArgs};
use poda::{
    BitVector, Ci, Fingerprint, LocalCache, PkgBuild, PodaError, RootTbl, ShortId, Weeder,
    WeederConfig,
};
use tempfile::{tempdir, TempDir};

struct Rig {
    _tmp: TempDir,
    cfg: WeederConfig,
    cache: LocalCache,
    repos: LocalRepository,
}

fn rig() -> Rig {
    let tmp = tempdir().expect("tmpdir");
    let cfg = WeederConfig {
        graph_log_dir: tmp.path().join("graphlog"),
        repos_dir: tmp.path().join("repos"),
        weeder_md_dir: tmp.path().join("weeder"),
        grace_period_secs: 0,
        ..Default::default()
    };
    let repos = LocalRepository::open(&cfg.repos_dir, LeaseConfig::default()).unwrap();
    let cache = LocalCache::open(&cfg.graph_log_dir).unwrap();
    Rig {
        _tmp: tmp,
        cfg,
        cache,
        repos,
    }
}

fn fp(tag: u8) -> Fingerprint {
    Fingerprint([tag; 16])
}

fn pkg(tag: u8) -> PkgBuild {
    PkgBuild::new(fp(tag), 1)
}

fn root(tag: u8, ts: i64, cis: &[u32], done: bool) -> Root {
    Root {
        pkg_fp: fp(tag),
        model: 1,
        ts,
        cis: cis.iter().map(|&c| Ci(c)).collect(),
        done,
    }
}

fn node(ci: u32, kids: &[u32], refs: &[u32]) -> Node {
    Node {
        ci: Ci(ci),
        loc: fp(ci as u8),
        model: 1,
        kids: kids.iter().map(|&c| Ci(c)).collect(),
        refs: refs.iter().map(|&d| ShortId(d)).collect(),
    }
}

/// Plants a derived file in the repository's storage tree.
fn plant(repos: &LocalRepository, sid: ShortId) {
    let path = shortid::short_id_path(repos.sid_dir(), sid);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"derived output").unwrap();
}

fn planted(repos: &LocalRepository, sid: ShortId) -> bool {
    shortid::short_id_path(repos.sid_dir(), sid).exists()
}

/// Lets planted files age past the start-time horizon of a weed recorded
/// afterwards.
fn age_files() {
    std::thread::sleep(Duration::from_millis(1600));
}

fn args(instr: Option<RootTbl>, keep_secs: u64) -> WeedArgs {
    WeedArgs {
        instr_roots: instr,
        del_status: DeletionStatus::DoDeletions,
        keep_secs,
        print_roots: false,
    }
}

fn keep_file_contents(rig: &Rig, dis: ShortId) -> Vec<ShortId> {
    rig.repos.read_keep_file(dis).unwrap()
}

fn stable_paths(rig: &Rig) -> StablePaths {
    StablePaths::new(&rig.cfg.weeder_md_dir).unwrap()
}

#[test]
fn s1_empty_cache_weed_is_a_noop() {
    let rig = rig();
    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    let resumed = weeder.weed(&args(Some(RootTbl::new()), 0)).unwrap();
    assert!(!resumed);

    let paths = stable_paths(&rig);
    assert!(stable::read_weeded(&paths).unwrap().is_empty());
    let vars = stable::read_misc_vars(&paths).unwrap().expect("misc vars");
    // The DIs-to-keep file contains only its own ShortId.
    assert_eq!(keep_file_contents(&rig, vars.dis_short_id), vec![vars.dis_short_id]);
    // end_mark was never called: start_mark rolled to generation 1 and
    // nothing rolled further.
    assert!(rig.cfg.graph_log_dir.join("1.log").exists());
    assert!(!rig.cfg.graph_log_dir.join("2.log").exists());
}

#[test]
fn s2_one_root_one_node_everything_kept() {
    let rig = rig();
    plant(&rig.repos, ShortId(0xdead_beef));
    rig.cache.record_root(&root(9, 100, &[42], true)).unwrap();
    rig.cache.record_node(&node(42, &[], &[0xdead_beef])).unwrap();
    age_files();

    let mut instr = RootTbl::new();
    instr.put(pkg(9), true);
    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    weeder.weed(&args(Some(instr), 0)).unwrap();

    let paths = stable_paths(&rig);
    assert!(stable::read_weeded(&paths).unwrap().is_empty());
    let vars = stable::read_misc_vars(&paths).unwrap().expect("misc vars");
    assert_eq!(vars.marked_roots.get(&pkg(9)), Some(true));
    assert!(keep_file_contents(&rig, vars.dis_short_id).contains(&ShortId(0xdead_beef)));
    assert!(rig.cache.contains(Ci(42)));
    assert!(planted(&rig.repos, ShortId(0xdead_beef)));
}

#[test]
fn s3_unreachable_entry_is_weeded() {
    let rig = rig();
    plant(&rig.repos, ShortId(0xdead_beef));
    plant(&rig.repos, ShortId(0xcafe_babe));
    rig.cache.record_root(&root(9, 100, &[42], true)).unwrap();
    rig.cache.record_node(&node(42, &[], &[0xdead_beef])).unwrap();
    rig.cache.record_node(&node(43, &[], &[0xcafe_babe])).unwrap();
    age_files();

    let mut instr = RootTbl::new();
    instr.put(pkg(9), true);

    // First pass without deletions: the hit filter must doom 43 at once.
    {
        let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
        let mut a = args(Some(instr.clone()), 0);
        a.del_status = DeletionStatus::NoDeletions;
        weeder.weed(&a).unwrap();
        assert!(rig.cache.is_hit_filtered(Ci(43)));
        assert!(!rig.cache.is_hit_filtered(Ci(42)));
        // Nothing committed: the weed is not resumable.
        assert!(stable::read_weeded(&stable_paths(&rig)).unwrap().is_empty());
    }

    // Second pass for real.
    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    weeder.weed(&args(Some(instr), 0)).unwrap();

    let paths = stable_paths(&rig);
    assert!(stable::read_weeded(&paths).unwrap().is_empty(), "weeded reset");
    let vars = stable::read_misc_vars(&paths).unwrap().expect("misc vars");
    let keep = keep_file_contents(&rig, vars.dis_short_id);
    assert!(keep.contains(&ShortId(0xdead_beef)));
    assert!(!keep.contains(&ShortId(0xcafe_babe)));

    assert!(rig.cache.contains(Ci(42)));
    assert!(!rig.cache.contains(Ci(43)));
    assert!(planted(&rig.repos, ShortId(0xdead_beef)));
    assert!(!planted(&rig.repos, ShortId(0xcafe_babe)));

    // The pruned checkpoint holds exactly the surviving entries.
    drop(rig.cache);
    let reopened = LocalCache::open(&rig.cfg.graph_log_dir).unwrap();
    assert!(reopened.contains(Ci(42)));
    assert!(!reopened.contains(Ci(43)));
}

#[test]
fn s4_fresh_root_is_kept_by_age() {
    let rig = rig();
    let now = shortid::now_secs() as i64;
    rig.cache.record_root(&root(7, now, &[42], true)).unwrap();
    rig.cache.record_node(&node(42, &[], &[])).unwrap();
    age_files();

    // Empty instructions, one hour of freshness.
    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    weeder.weed(&args(Some(RootTbl::new()), 3600)).unwrap();

    let vars = stable::read_misc_vars(&stable_paths(&rig))
        .unwrap()
        .expect("misc vars");
    assert_eq!(vars.marked_roots.get(&pkg(7)), Some(false), "kept by age, not instruction");
    assert!(rig.cache.contains(Ci(42)));
}

#[test]
fn s5_interrupted_deletion_phase_resumes() {
    let rig = rig();
    plant(&rig.repos, ShortId(0xcafe_babe));
    rig.cache.record_root(&root(9, 100, &[42], true)).unwrap();
    rig.cache.record_node(&node(42, &[], &[0xdead_beef])).unwrap();
    rig.cache.record_node(&node(43, &[], &[0xcafe_babe])).unwrap();
    age_files();

    // Fabricate the stable state a weeder leaves when it crashes right
    // after committing the mark phase: weeded = {43}, misc vars present.
    let paths = stable_paths(&rig);
    let (dis_sid, file) = rig.repos.create_derived().unwrap();
    {
        let mut f = file;
        writeln!(f, "{dis_sid}").unwrap();
        writeln!(f, "deadbeef").unwrap();
        f.sync_all().unwrap();
    }
    let mut marked_roots = RootTbl::new();
    marked_roots.put(pkg(9), true);
    stable::write_misc_vars(
        &paths,
        &MiscVars {
            start_time: shortid::now_secs() as i64,
            keep_time: 50,
            dis_short_id: dis_sid,
            marked_roots,
        },
    )
    .unwrap();
    let weeded: BitVector = [43u32].into_iter().collect();
    stable::write_weeded(&paths, &weeded).unwrap();

    // Recovery skips the mark phase and runs only the deletion phase.
    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    assert!(weeder.resumable());
    let resumed = weeder.weed(&args(None, 0)).unwrap();
    assert!(resumed);

    assert!(stable::read_weeded(&paths).unwrap().is_empty());
    assert!(rig.cache.contains(Ci(42)));
    assert!(!rig.cache.contains(Ci(43)));
    assert!(!planted(&rig.repos, ShortId(0xcafe_babe)));
}

#[test]
fn s6_marked_root_missing_from_graph_log_is_fatal() {
    let rig = rig();
    rig.cache.record_root(&root(9, 100, &[42], true)).unwrap();
    rig.cache.record_node(&node(42, &[], &[])).unwrap();
    rig.cache.record_node(&node(43, &[], &[])).unwrap();
    age_files();

    let paths = stable_paths(&rig);
    let (dis_sid, file) = rig.repos.create_derived().unwrap();
    {
        let mut f = file;
        writeln!(f, "{dis_sid}").unwrap();
        f.sync_all().unwrap();
    }
    // The stable marked roots name a build the graph log has never seen.
    let mut marked_roots = RootTbl::new();
    marked_roots.put(PkgBuild::new(fp(0x51), 1), true);
    stable::write_misc_vars(
        &paths,
        &MiscVars {
            start_time: shortid::now_secs() as i64,
            keep_time: 50,
            dis_short_id: dis_sid,
            marked_roots,
        },
    )
    .unwrap();
    stable::write_weeded(&paths, &[43u32].into_iter().collect()).unwrap();

    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    let err = weeder.weed(&args(None, 0)).unwrap_err();
    match err {
        PodaError::Inconsistent(msg) => {
            assert!(msg.contains("erase the weeder metadata"), "got: {msg}");
        }
        other => panic!("expected an inconsistency error, got {other}"),
    }
    // The failed weed is still pending.
    assert!(!stable::read_weeded(&paths).unwrap().is_empty());
}

#[test]
fn resumed_weed_is_followed_by_a_fresh_one() {
    let rig = rig();
    rig.cache.record_root(&root(9, 100, &[42], true)).unwrap();
    rig.cache.record_node(&node(42, &[], &[])).unwrap();
    rig.cache.record_node(&node(43, &[], &[])).unwrap();
    age_files();

    // Pending deletion of 43 from a previous weed.
    let paths = stable_paths(&rig);
    let (dis_sid, file) = rig.repos.create_derived().unwrap();
    {
        let mut f = file;
        writeln!(f, "{dis_sid}").unwrap();
        f.sync_all().unwrap();
    }
    let mut marked_roots = RootTbl::new();
    marked_roots.put(pkg(9), true);
    stable::write_misc_vars(
        &paths,
        &MiscVars {
            start_time: shortid::now_secs() as i64,
            keep_time: 50,
            dis_short_id: dis_sid,
            marked_roots,
        },
    )
    .unwrap();
    stable::write_weeded(&paths, &[43u32].into_iter().collect()).unwrap();

    let mut instr = RootTbl::new();
    instr.put(pkg(9), true);
    let a = args(Some(instr), 0);

    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    let resumed = weeder.weed(&a).unwrap();
    assert!(resumed, "first weed completes the pending deletion");
    assert!(!rig.cache.contains(Ci(43)));

    // The caller then runs the requested weed from scratch.
    let mut weeder = Weeder::new(&rig.cache, &rig.repos, &rig.cfg).unwrap();
    let resumed = weeder.weed(&a).unwrap();
    assert!(!resumed);
    assert!(rig.cache.contains(Ci(42)));
}

#[test]
fn query_paths_are_exercised_via_config() {
    // A smoke check that the scenario rig round-trips through the config
    // loader the CLI uses.
    let tmp = tempdir().expect("tmpdir");
    let path: PathBuf = tmp.path().join("weeder.toml");
    std::fs::write(
        &path,
        format!(
            "graph_log_dir = {:?}\nrepos_dir = {:?}\nweeder_md_dir = {:?}\n",
            tmp.path().join("graphlog"),
            tmp.path().join("repos"),
            tmp.path().join("weeder"),
        ),
    )
    .unwrap();
    let cfg = WeederConfig::load(Some(path)).unwrap();
    assert_eq!(cfg.graph_log_dir, tmp.path().join("graphlog"));
    let repos = LocalRepository::open(&cfg.repos_dir, cfg.lease_config()).unwrap();
    let cache = LocalCache::open(&cfg.graph_log_dir).unwrap();
    let mut weeder = Weeder::new(&cache, &repos, &cfg).unwrap();
    assert!(!weeder.weed(&args(Some(RootTbl::new()), 0)).unwrap());
}

//! End-to-end pipeline runs against shell-script stand-ins for the engine.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use foldrun_batch::fakes::{CompletionHook, JobScript, ScriptedBatchSystem};
use foldrun_batch::{BatchSession, JobId, JobTemplate};
use foldrun_core::pipeline::chain_builder_input;
use foldrun_core::{
    ClusterConfig, EngineConfig, ParseError, ProcessError, ProgressEvent, ProgressSink,
    ReconError, ReconstructRequest, Reconstructor, Refinement, RestraintSpec, Stage, StageError,
};

// -------------------------------------------------------------------------
// Fake engine
// -------------------------------------------------------------------------

const PRELUDE: &str = r#"#!/bin/sh
next_name() {
    if [ ! -e "$1" ]; then echo "$1"; return; fi
    i=2
    while [ -e "$1_$i" ]; do i=$((i+1)); done
    echo "$1_$i"
}
"#;

const PROTEIN: &str = r#"
read -r base
rest=$(cat)
echo "    3  $base unfolded" > "$(next_name "$base.xyz")"
echo "GCA" > "$(next_name "$base.seq")"
printf '%s\n%s\n' "$base" "$rest" > "$(next_name "$base.int")"
echo " Protein Structure Builder"
"#;

const DISTGEOM: &str = r#"
xyz="$1"
n="$2"
dir=$(dirname "$xyz")
f=$(basename "$xyz")
stem="${f%.*}"
k=1
while [ "$k" -le "$n" ]; do
    out=$(next_name "$dir/$stem.$(printf %03d "$k")")
    echo "model $k" > "$out"
    upper=$(( (k * 7) % 5 ))
    echo " Final Error Function Value :   $k.5000"
    echo " Num Upper Bound Violations :    $upper"
    echo " Num Lower Bound Violations :    0"
    echo " Max Upper Bound Violation :     0.5000"
    echo " Max Lower Bound Violation :     0.0000"
    echo " RMS Deviation from Bounds :     0.0400"
    echo " Num Upper Restraint Violations :    1"
    echo " Num Lower Restraint Violations :    0"
    echo " Max Upper Restraint Violation : 0.3000"
    echo " Max Lower Restraint Violation : 0.0000"
    echo " RMS Restraint Dist Violation :  0.1000"
    k=$((k+1))
done
"#;

const XYZPDB: &str = r#"
dir=$(dirname "$1")
f=$(basename "$1")
stem="${f%.*}"
if [ ! -e "$dir/$stem.seq" ]; then
    echo " TINKER is Unable to Continue; no sequence file"
    exit 0
fi
echo "ATOM      1  N   GLY A   1 from $f" > "$(next_name "$dir/$stem.pdb")"
"#;

const PDBXYZ: &str = r#"
dir=$(dirname "$1")
f=$(basename "$1")
stem="${f%.*}"
echo "    3  from $f" > "$(next_name "$dir/$stem.xyz")"
echo "GCA" > "$(next_name "$dir/$stem.seq")"
"#;

const MINIMIZE: &str = r#"
dir=$(dirname "$1")
f=$(basename "$1")
stem="${f%.*}"
echo " Final Function Value :        -123.4567"
echo "    3  minimized" > "$(next_name "$dir/$stem.xyz")"
"#;

const ANALYZE: &str = r#"
echo " Total Potential Energy :        -98.7654 Kcal/mole"
"#;

/// Engine variants, each a directory with all six programs.
fn engines() -> &'static Path {
    static ROOT: OnceLock<PathBuf> = OnceLock::new();
    ROOT.get_or_init(|| {
        // written once, before any test launches a program
        let root = tempfile::tempdir().unwrap().into_path();
        let normal = [
            ("protein", PROTEIN.to_string()),
            ("distgeom", DISTGEOM.to_string()),
            ("xyzpdb", XYZPDB.to_string()),
            ("pdbxyz", PDBXYZ.to_string()),
            ("minimize", MINIMIZE.to_string()),
            ("analyze", ANALYZE.to_string()),
        ];
        let variants: [(&str, Option<(&str, String)>); 5] = [
            ("normal", None),
            (
                "marker",
                Some((
                    "distgeom",
                    "echo ' TINKER is Unable to Continue; Terminating the Current Calculation'\nexit 0\n"
                        .to_string(),
                )),
            ),
            ("oom", Some(("distgeom", "exit 137\n".to_string()))),
            ("short", Some(("distgeom", DISTGEOM.replace("n=\"$2\"", "n=1")))),
            (
                "chkxyz",
                Some((
                    "minimize",
                    "echo ' CHKXYZ  --  Warning, Atoms 1 and 2 have Identical Coordinates'\n"
                        .to_string(),
                )),
            ),
        ];

        for (variant, replacement) in variants {
            let dir = root.join(variant);
            std::fs::create_dir_all(&dir).unwrap();
            for (name, body) in &normal {
                let body = match &replacement {
                    Some((replaced, alt)) if replaced == name => alt.clone(),
                    _ => body.clone(),
                };
                let path = dir.join(name);
                std::fs::write(&path, format!("{}{}", PRELUDE, body)).unwrap();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            }
        }
        root
    })
}

fn reconstructor(variant: &str) -> Reconstructor {
    let engine = EngineConfig {
        bin_dir: engines().join(variant),
        forcefield: PathBuf::from("/ff/amber99.prm"),
        refinement: Refinement::Annealing,
        probe_retries: 3,
        probe_delay_ms: 20,
    };
    let cluster = ClusterConfig {
        poll_interval_ms: 20,
        output_retries: 3,
        output_retry_ms: 20,
        seed: Some(11),
        ..ClusterConfig::default()
    };
    Reconstructor::new(engine, cluster).unwrap()
}

fn restraints() -> RestraintSpec {
    RestraintSpec::new("GCA").with_distance(2, 15, 3.5, 8.0)
}

fn recorder() -> (Arc<dyn ProgressSink>, Arc<Mutex<Vec<ProgressEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink: Arc<dyn ProgressSink> = {
        let events = Arc::clone(&events);
        Arc::new(move |event: ProgressEvent| events.lock().unwrap().push(event))
    };
    (sink, events)
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Scheduler whose finished jobs leave an output and a statistics log with
/// `index` upper bound violations.
fn cluster_hook() -> CompletionHook {
    Arc::new(|template: &JobTemplate, id: &JobId| {
        let index: usize = template
            .job_name
            .rsplit('_')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let log = format!(
            " Final Error Function Value :   1.0000\n\
             \x20Num Upper Bound Violations :    {index}\n\
             \x20Num Lower Bound Violations :    0\n\
             \x20Max Upper Bound Violation :     0.5000\n\
             \x20Max Lower Bound Violation :     0.0000\n\
             \x20RMS Deviation from Bounds :     0.0400\n\
             \x20Num Upper Restraint Violations :    1\n\
             \x20Num Lower Restraint Violations :    0\n\
             \x20Max Upper Restraint Violation : 0.3000\n\
             \x20Max Lower Restraint Violation : 0.0000\n\
             \x20RMS Restraint Dist Violation :  0.1000\n"
        );
        std::fs::write(template.stdout_log(id), log).unwrap();
        let output = PathBuf::from(&template.args[0]).with_extension("001");
        std::fs::write(output, format!("model from job {}\n", index)).unwrap();
    })
}

// -------------------------------------------------------------------------
// Serial runs
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_serial_reconstruction_end_to_end() {
    let work = tempfile::tempdir().unwrap();
    let root = work.path().canonicalize().unwrap();
    let mut recon = reconstructor("normal");
    let (sink, events) = recorder();
    let request = ReconstructRequest::new(work.path(), "m", 3).progress(sink);

    let result = recon.reconstruct(&restraints(), &request).await.unwrap();

    assert_eq!(result.model_count(), 3);
    assert_eq!(result.best_model(), 3);
    assert_eq!(result.bound_violations(1).unwrap(), 2);
    assert_eq!(result.bound_violations(2).unwrap(), 4);
    assert_eq!(result.statistics()[1].final_error, 2.5);
    assert_eq!(result.best_pdb_file(), root.join("m.003.pdb"));
    for model in 1..=3 {
        let pdb = result.out_pdb_file(model).unwrap();
        let text = std::fs::read_to_string(&pdb).unwrap();
        assert!(text.contains(&format!("from m.{:03}", model)));
    }

    let key = std::fs::read_to_string(root.join("m.key")).unwrap();
    assert_eq!(
        key,
        "PARAMETERS /ff/amber99.prm\nRESTRAIN-DISTANCE 2 15 100.0 3.5 8.0\n"
    );
    assert!(std::fs::read_to_string(root.join("m.pdb"))
        .unwrap()
        .contains("from m.xyz"));
    assert_eq!(
        std::fs::read_to_string(root.join("m.int")).unwrap(),
        chain_builder_input("m", Path::new("/ff/amber99.prm"), &restraints())
    );

    let log = std::fs::read_to_string(root.join("m.engine.log")).unwrap();
    // protein, xyzpdb of the chain, distgeom, one xyzpdb per model
    assert_eq!(log.lines().filter(|l| l.starts_with("#cmd: ")).count(), 6);
    assert!(log.contains(" 3 Y N Y Y N N A"));

    assert_eq!(
        *events.lock().unwrap(),
        [
            ProgressEvent::Stage(Stage::Protein),
            ProgressEvent::Stage(Stage::Constraints),
            ProgressEvent::Stage(Stage::Structures),
            ProgressEvent::ModelsDone { done: 3, total: 3 },
            ProgressEvent::Stage(Stage::Selection),
        ]
    );
    assert_eq!(recon.last_result().unwrap().best_model(), 3);
}

#[tokio::test]
async fn test_tool_error_marker_fails_structures_stage() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("marker");
    let request = ReconstructRequest::new(work.path(), "m", 2);

    let err = recon.reconstruct(&restraints(), &request).await.unwrap_err();

    assert!(matches!(
        err,
        ReconError::Stage {
            stage: Stage::Structures,
            source: StageError::Process(ProcessError::ToolReported { .. }),
        }
    ));
    assert!(matches!(recon.last_result(), Err(ReconError::NoResult)));
}

#[tokio::test]
async fn test_exit_137_is_resource_exhaustion() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("oom");
    let request = ReconstructRequest::new(work.path(), "m", 2);

    let err = recon.reconstruct(&restraints(), &request).await.unwrap_err();

    assert!(matches!(
        err,
        ReconError::Stage {
            stage: Stage::Structures,
            source: StageError::Process(ProcessError::ResourceExhausted { code: 137, .. }),
        }
    ));
}

#[tokio::test]
async fn test_short_statistics_output() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("short");
    let request = ReconstructRequest::new(work.path(), "m", 2);

    let err = recon.reconstruct(&restraints(), &request).await.unwrap_err();

    assert!(matches!(
        err,
        ReconError::Stage {
            stage: Stage::Structures,
            source: StageError::Parse(ParseError::ShortOutput {
                expected: 2,
                found: 1
            }),
        }
    ));
}

#[tokio::test]
async fn test_failed_run_with_cleanup_leaves_only_log() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("oom");
    let request = ReconstructRequest::new(work.path(), "m", 2).cleanup(true);

    recon.reconstruct(&restraints(), &request).await.unwrap_err();

    assert_eq!(file_names(work.path()), ["m.engine.log"]);
}

#[tokio::test]
async fn test_repeated_runs_with_cleanup() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("normal");
    let request = ReconstructRequest::new(work.path(), "m", 2).cleanup(true);

    recon.reconstruct(&restraints(), &request).await.unwrap();
    let result = recon.reconstruct(&restraints(), &request).await.unwrap();
    assert_eq!(result.model_count(), 2);
    assert!(result.out_pdb_file(2).unwrap().exists());
    assert!(file_names(work.path()).iter().all(|n| !n.contains('_')));

    // the result owns the generated files
    drop(recon);
    assert_eq!(file_names(work.path()), ["m.engine.log"]);
}

#[tokio::test]
async fn test_repeated_runs_without_cleanup_rename_over_leftovers() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("normal");
    let request = ReconstructRequest::new(work.path(), "m", 2);

    recon.reconstruct(&restraints(), &request).await.unwrap();
    recon.reconstruct(&restraints(), &request).await.unwrap();

    let names = file_names(work.path());
    assert!(names.iter().all(|n| !n.contains('_')), "leftovers: {:?}", names);
    assert!(names.contains(&"m.002.pdb".to_string()));
}

#[tokio::test]
async fn test_last_result_replaced_by_next_run() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("normal");

    recon
        .reconstruct(&restraints(), &ReconstructRequest::new(work.path(), "a", 3))
        .await
        .unwrap();
    recon
        .reconstruct(&restraints(), &ReconstructRequest::new(work.path(), "b", 2))
        .await
        .unwrap();

    let last = recon.last_result().unwrap();
    assert_eq!(last.base_name(), "b");
    assert_eq!(last.model_count(), 2);
    assert!(matches!(
        last.out_pdb_file(3),
        Err(ReconError::ModelOutOfRange { model: 3, count: 2 })
    ));
}

#[tokio::test]
async fn test_invalid_requests() {
    let work = tempfile::tempdir().unwrap();
    let mut recon = reconstructor("normal");

    let zero = ReconstructRequest::new(work.path(), "m", 0);
    assert!(matches!(
        recon.reconstruct(&restraints(), &zero).await,
        Err(ReconError::InvalidRequest(_))
    ));

    let parallel = ReconstructRequest::new(work.path(), "m", 2).parallel(true);
    assert!(matches!(
        recon.reconstruct(&restraints(), &parallel).await,
        Err(ReconError::InvalidRequest(_))
    ));

    let missing = ReconstructRequest::new(work.path().join("nope"), "m", 2);
    assert!(matches!(
        recon.reconstruct(&restraints(), &missing).await,
        Err(ReconError::InvalidRequest(_))
    ));

    let bad_sequence = RestraintSpec::new("GXA");
    let request = ReconstructRequest::new(work.path(), "m", 2);
    assert!(matches!(
        recon.reconstruct(&bad_sequence, &request).await,
        Err(ReconError::InvalidRequest(_))
    ));
}

// -------------------------------------------------------------------------
// Cluster runs
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_parallel_reconstruction() {
    let work = tempfile::tempdir().unwrap();
    let system = Arc::new(ScriptedBatchSystem::new(vec![]).on_completion(cluster_hook()));
    let mut recon = reconstructor("normal").with_batch_system(system.clone());
    let request = ReconstructRequest::new(work.path(), "m", 3)
        .parallel(true)
        .cleanup(true);

    let result = recon.reconstruct(&restraints(), &request).await.unwrap();

    assert_eq!(result.model_count(), 3);
    assert_eq!(result.best_model(), 1);
    assert_eq!(result.bound_violations(3).unwrap(), 3);
    assert!(std::fs::read_to_string(result.out_pdb_file(2).unwrap())
        .unwrap()
        .contains("from m.002"));

    let session = system.last_session().unwrap();
    assert_eq!(session.submit_attempts(), 4);
    assert_eq!(session.close_calls(), 1);
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_stop_interrupts_cluster_run() {
    let work = tempfile::tempdir().unwrap();
    let system = Arc::new(ScriptedBatchSystem::new(vec![]).with_default(JobScript::Hang));
    let mut recon = reconstructor("normal").with_batch_system(system.clone());
    let handle = recon.interrupt_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.interrupt();
    });

    let request = ReconstructRequest::new(work.path(), "m", 2)
        .parallel(true)
        .cleanup(true);
    let err = recon.reconstruct(&restraints(), &request).await.unwrap_err();

    assert!(err.is_interrupted());
    let session = system.last_session().unwrap();
    assert_eq!(session.alive_jobs(), 0);
    assert_eq!(session.close_calls(), 1);
    assert_eq!(file_names(work.path()), ["m.engine.log"]);
}

// -------------------------------------------------------------------------
// Single-structure tools
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_minimize_writes_min_pdb() {
    let work = tempfile::tempdir().unwrap();
    let pdb = work.path().join("x.pdb");
    std::fs::write(&pdb, "ATOM      1  N   GLY A   1\n").unwrap();
    let recon = reconstructor("normal");

    let energy = recon.minimize(&pdb, 0.01).await.unwrap();

    assert_eq!(energy, -123.4567);
    let min_pdb = work.path().join("x.min.pdb");
    assert!(std::fs::read_to_string(min_pdb)
        .unwrap()
        .contains("from x.xyz"));
    assert_eq!(
        file_names(work.path()),
        ["x.min.pdb", "x.pdb", "x.tools.log"]
    );
}

#[tokio::test]
async fn test_compute_energy() {
    let work = tempfile::tempdir().unwrap();
    let pdb = work.path().join("x.pdb");
    std::fs::write(&pdb, "ATOM      1  N   GLY A   1\n").unwrap();
    let recon = reconstructor("normal");

    let energy = recon.compute_energy(&pdb).await.unwrap();

    assert_eq!(energy, -98.7654);
    assert_eq!(file_names(work.path()), ["x.pdb", "x.tools.log"]);
}

#[tokio::test]
async fn test_minimize_rejects_coordinate_warning() {
    let work = tempfile::tempdir().unwrap();
    let pdb = work.path().join("x.pdb");
    std::fs::write(&pdb, "ATOM      1  N   GLY A   1\n").unwrap();
    let recon = reconstructor("chkxyz");

    let err = recon.minimize(&pdb, 0.01).await.unwrap_err();

    assert!(matches!(
        err,
        ReconError::Tool {
            operation: "minimize",
            source: StageError::InputWarning { .. },
        }
    ));
}

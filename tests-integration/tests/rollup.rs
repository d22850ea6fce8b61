//! Plans in rollup mode

use anyhow::Result;
use sweeper::PlanStore;
use sweeper::plan::rollup::DeletionUnit;
use tests_integration::fixtures::SweepTestContext;
use tests_integration::init_test_logging;

#[tokio::test]
async fn test_rollup_records_uniform_prefixes() -> Result<()> {
    init_test_logging();

    let mut ctx = SweepTestContext::new_in_memory()?;
    ctx.storage.put("runs/r1/a.bin", 10).await?;
    ctx.storage.put("runs/r1/deep/b.bin", 20).await?;
    ctx.storage.put("runs/r2/a.bin", 30).await?;
    ctx.storage.put("runs/r2/task.log", 5).await?;
    ctx.storage.put("tmp/x", 40).await?;
    ctx.advance_days(100);
    ctx.set_rollup();

    let pipeline = ctx.pipeline();
    pipeline.inventory().await?;
    let summary = pipeline.plan().await?;
    assert_eq!(summary.to_delete, 4);
    assert_eq!(summary.units, Some(3));

    let store = PlanStore::open(&ctx.config.plan.path).await?;
    let units = store.prefixes().await?;
    store.close().await;

    assert_eq!(
        units,
        vec![
            DeletionUnit {
                path: "runs/r1/".to_string(),
                is_prefix: true,
                objects: 2,
                bytes: 30,
            },
            DeletionUnit {
                path: "runs/r2/a.bin".to_string(),
                is_prefix: false,
                objects: 1,
                bytes: 30,
            },
            DeletionUnit {
                path: "tmp/".to_string(),
                is_prefix: true,
                objects: 1,
                bytes: 40,
            },
        ]
    );

    // the executor still works object by object
    let report = pipeline.clean().await?;
    assert_eq!(report.objects_deleted, 4);
    assert_eq!(ctx.storage.list_all_objects().await?, vec!["runs/r2/task.log"]);
    Ok(())
}

#[tokio::test]
async fn test_plain_plan_has_no_units() -> Result<()> {
    init_test_logging();

    let ctx = SweepTestContext::new_in_memory()?;
    ctx.storage.put("tmp/x", 40).await?;

    let pipeline = ctx.pipeline();
    pipeline.inventory().await?;
    let summary = pipeline.plan().await?;
    assert_eq!(summary.units, None);

    let store = PlanStore::open(&ctx.config.plan.path).await?;
    assert!(store.prefixes().await?.is_empty());
    store.close().await;
    Ok(())
}

#[tokio::test]
async fn test_snapshot_written_next_to_plan() -> Result<()> {
    init_test_logging();

    let mut ctx = SweepTestContext::new_in_memory()?;
    ctx.config.plan.snapshot_path = Some(ctx.snapshot_path());
    for i in 0..5 {
        ctx.storage.put(&format!("tmp/{i}"), 10).await?;
    }

    let pipeline = ctx.pipeline();
    pipeline.inventory().await?;
    pipeline.plan().await?;

    let snapshot = std::fs::metadata(ctx.snapshot_path())?;
    assert!(snapshot.len() > 0);
    Ok(())
}

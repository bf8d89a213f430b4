use stress_test::{stress_test_rules, stress_test_scaling, stress_test_views};
use tracing_subscriber::EnvFilter;
use vsr_sdk::SdkError;
pub mod stress_test;

#[tokio::main]
async fn main() -> Result<(), SdkError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                              ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_converged = true;

    // Test 1: few streams, heavy contention
    let stats = stress_test_rules(2, 4, 200, 1).await?;
    stats.print();
    all_converged &= stats.all_converged();

    // Test 2: many streams
    let stats = stress_test_rules(16, 2, 250, 2).await?;
    stats.print();
    all_converged &= stats.all_converged();

    // Test 3: result reconciliation, small
    let stats = stress_test_views(4, 200, 8, 3).await?;
    stats.print();
    all_converged &= stats.all_converged();

    // Test 4: result reconciliation, wide
    let stats = stress_test_views(12, 500, 32, 4).await?;
    stats.print();
    all_converged &= stats.all_converged();

    // Test 5: Scaling analysis
    all_converged &= stress_test_scaling(20, 4).await?;

    if all_converged {
        println!("\n✓ All stress tests completed successfully!");
        Ok(())
    } else {
        println!("\n✗ Some replicas failed to converge");
        std::process::exit(1);
    }
}

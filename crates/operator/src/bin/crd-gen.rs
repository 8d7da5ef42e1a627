use app_operator::ManagedApp;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crd = ManagedApp::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
